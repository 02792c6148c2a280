//! # Call State Detection
//!
//! Decides from what the telephony page shows whether a dialed call is
//! ringing, answered, on voicemail or over, and makes sure every call ends
//! with the line released.
//!
//! ## Key Components:
//! - **State**: pure lifecycle state machine and sample classification
//! - **Signals**: pluggable sampler turning the page into `CallSignals`
//! - **Hang-up**: verified escalation of hang-up strategies
//! - **Watchdog**: per-call timer set and activity clock
//! - **Monitor**: ties the above together for one call

pub mod hangup;
pub mod monitor;
pub mod signals;
pub mod state;
pub mod watchdog;

pub use monitor::CallMonitor;
pub use state::{CallState, StateTransition};
