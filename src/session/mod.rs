//! # Conversation Session Module
//!
//! Connection to the external conversational voice service.
//!
//! ## Key Components:
//! - **Protocol**: inbound/outbound JSON message types
//! - **Readiness Gate**: buffering and reconnect sub-state machine for the send path
//! - **Client**: the WebSocket connection, keep-alive and bounded reconnect

pub mod client;
pub mod gate;
pub mod protocol;

pub use client::{ConversationLink, SessionClient, SessionEvent};
