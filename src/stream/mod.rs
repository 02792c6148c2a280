//! # Call Audio Streaming
//!
//! Moves audio between the call page and the conversation, plays agent
//! audio back and keeps the per-call transcript.

pub mod capture_script;
pub mod handler;
pub mod transcript;

pub use handler::{AudioStreamHandler, AudioStreamHandlerBuilder, CallTerminator, PageAttachment, StopReason};
pub use transcript::{ConversationTurn, Speaker, TranscriptLog};
