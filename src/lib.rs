//! # voice-dialer
//!
//! Places outbound calls through a browser-driven telephony page and patches a
//! conversational voice agent into the call audio.
//!
//! ## Layout:
//! - **detector**: call lifecycle state machine watching page signals
//! - **session**: WebSocket client for the conversational speech service
//! - **stream**: per-call audio handler (capture → agent → playback)
//! - **relay**: local WebSocket the page streams captured audio into
//! - **call**: single-call glue, registry and persistence
//! - **audio**: PCM transcoding, buffers, playback sinks, recording
//!
//! The HTTP host (`main.rs`) exposes health, metrics, config, call status and
//! the relay endpoint on top of [`state::AppState`].

pub mod audio;
pub mod call;
pub mod config;
pub mod detector;
pub mod driver;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod relay;
pub mod session;
pub mod state;
pub mod stream;
