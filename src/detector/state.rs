//! # Call State Machine
//!
//! Pure call-lifecycle logic. Nothing in here touches the page or a timer;
//! the monitor feeds it sampled signals and acts on the transitions it returns.
//!
//! ```text
//! Idle → Dialing → (Ringing →) Connected → (Voicemail →) Ended
//!   any non-terminal state → Failed
//! ```

use crate::detector::signals::CallSignals;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Dialing,
    Ringing,
    Connected,
    Voicemail,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Dialing => "dialing",
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::Voicemail => "voicemail",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        }
    }

    /// Whether `self → to` is a legal edge.
    pub fn can_transition_to(&self, to: CallState) -> bool {
        use CallState::*;
        if self.is_terminal() || *self == to {
            return false;
        }
        if to == Failed {
            return true;
        }
        matches!(
            (self, to),
            (Idle, Dialing)
                | (Dialing, Ringing)
                | (Dialing, Connected)
                | (Ringing, Connected)
                | (Connected, Voicemail)
                | (Connected, Ended)
                | (Voicemail, Ended)
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a call's state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub timestamp: DateTime<Utc>,
    pub from: CallState,
    pub to: CallState,
    pub reason: String,
}

/// Current state plus the append-only history of how it got there.
#[derive(Debug, Clone)]
pub struct CallStateMachine {
    state: CallState,
    history: Vec<StateTransition>,
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            state: CallState::Idle,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Move to `to` if the edge is legal.
    ///
    /// Returns the recorded transition, or `None` when the move was refused
    /// (terminal state, same state, or an edge the lifecycle does not allow).
    pub fn transition(&mut self, to: CallState, reason: impl Into<String>) -> Option<StateTransition> {
        if !self.state.can_transition_to(to) {
            return None;
        }
        let transition = StateTransition {
            timestamp: Utc::now(),
            from: self.state,
            to,
            reason: reason.into(),
        };
        self.state = to;
        self.history.push(transition.clone());
        Some(transition)
    }
}

pub const SETTLE_FAILURE_REASON: &str = "not connected within settle window";

/// Classify the single definitive sample taken after the settle window.
pub fn classify_settle(signals: &CallSignals, detect_ringing: bool) -> (CallState, &'static str) {
    if signals.hangup_visible {
        (CallState::Connected, "hang-up control visible")
    } else if detect_ringing && signals.ringing {
        (CallState::Ringing, "ringing indicator visible")
    } else {
        (CallState::Failed, SETTLE_FAILURE_REASON)
    }
}

/// Classify a periodic sample against the current state.
///
/// Returns the state the call should move to, or `None` to stay put.
pub fn classify(
    current: CallState,
    signals: &CallSignals,
    detect_ringing: bool,
) -> Option<(CallState, &'static str)> {
    match current {
        CallState::Dialing if signals.hangup_visible => {
            Some((CallState::Connected, "hang-up control visible"))
        }
        CallState::Dialing if detect_ringing && signals.ringing => {
            Some((CallState::Ringing, "ringing indicator visible"))
        }
        CallState::Ringing if signals.hangup_visible => {
            Some((CallState::Connected, "hang-up control visible"))
        }
        CallState::Connected if !signals.hangup_visible => {
            Some((CallState::Ended, "hang-up control disappeared"))
        }
        CallState::Connected if signals.voicemail => {
            Some((CallState::Voicemail, "voicemail greeting detected"))
        }
        CallState::Voicemail if !signals.hangup_visible => {
            Some((CallState::Ended, "hang-up control disappeared"))
        }
        _ => None,
    }
}
