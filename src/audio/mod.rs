//! # Audio Module
//!
//! Everything that touches raw call audio.
//!
//! ## Key Components:
//! - **Transcoder**: PCM ↔ WAV, segment concatenation, duration estimates
//! - **Recording Buffer**: ordered accumulation of both sides of a call
//! - **Capture Gate**: size and playback-echo gates for captured frames
//! - **Playback**: FIFO queue and output sinks for agent audio
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod buffer;
pub mod playback;
pub mod processor;
pub mod transcoder;
