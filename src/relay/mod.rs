//! # Local Capture Relay
//!
//! Carries call audio between the telephony page and the call that owns it.
//! The page connects over WebSocket; the hub routes frames by call id.

pub mod hub;
pub mod websocket;

pub use hub::{PageCommand, RelayHub};
pub use websocket::{capture_websocket, CaptureWebSocket, RelayMessage};
