//! # Call Registry
//!
//! Tracks live and recently finished calls so the HTTP layer can serve
//! snapshots, and enforces the concurrent-call limit.
//!
//! ## Lifecycle of an entry:
//! 1. **register**: created when dialing starts (counts against the limit)
//! 2. **record_transition**: every lifecycle transition is mirrored here
//! 3. **complete**: terminal state reached; the call no longer counts as live
//! 4. **cleanup_old**: finished entries past the retention window are dropped

use crate::call::runner::Contact;
use crate::detector::state::{CallState, StateTransition};
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

struct CallEntry {
    call_id: String,
    contact_id: String,
    contact_name: String,
    phone_number: String,
    created_at: DateTime<Utc>,
    live: RwLock<LiveState>,
}

struct LiveState {
    state: CallState,
    transitions: Vec<StateTransition>,
    ended_at: Option<DateTime<Utc>>,
    recording_path: Option<PathBuf>,
}

/// Point-in-time view of one call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: String,
    pub contact_id: String,
    pub contact_name: String,
    pub phone_number: String,
    pub state: CallState,
    pub transitions: Vec<StateTransition>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_path: Option<PathBuf>,
}

impl CallEntry {
    fn snapshot(&self) -> CallSnapshot {
        let live = self.live.read();
        let end = live.ended_at.unwrap_or_else(Utc::now);
        CallSnapshot {
            call_id: self.call_id.clone(),
            contact_id: self.contact_id.clone(),
            contact_name: self.contact_name.clone(),
            phone_number: self.phone_number.clone(),
            state: live.state,
            transitions: live.transitions.clone(),
            created_at: self.created_at,
            ended_at: live.ended_at,
            duration_seconds: end.signed_duration_since(self.created_at).num_milliseconds() as f64
                / 1000.0,
            recording_path: live.recording_path.clone(),
        }
    }

    fn is_live(&self) -> bool {
        self.live.read().ended_at.is_none()
    }
}

/// Shared registry of calls. Cloning shares the same table.
#[derive(Clone)]
pub struct CallRegistry {
    calls: Arc<RwLock<HashMap<String, Arc<CallEntry>>>>,
    max_concurrent_calls: usize,
}

impl CallRegistry {
    pub fn new(max_concurrent_calls: usize) -> Self {
        Self {
            calls: Arc::new(RwLock::new(HashMap::new())),
            max_concurrent_calls,
        }
    }

    /// Register a new call attempt and return its id.
    pub fn register(&self, call_id: Option<String>, contact: &Contact) -> AppResult<String> {
        let mut calls = self.calls.write();

        let live = calls.values().filter(|entry| entry.is_live()).count();
        if live >= self.max_concurrent_calls {
            return Err(AppError::BadRequest(format!(
                "Maximum concurrent calls ({}) reached",
                self.max_concurrent_calls
            )));
        }

        let call_id = call_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if calls.contains_key(&call_id) {
            return Err(AppError::BadRequest(format!(
                "Call ID '{}' already exists",
                call_id
            )));
        }

        calls.insert(
            call_id.clone(),
            Arc::new(CallEntry {
                call_id: call_id.clone(),
                contact_id: contact.id.clone(),
                contact_name: contact.name.clone(),
                phone_number: contact.phone_number.clone(),
                created_at: Utc::now(),
                live: RwLock::new(LiveState {
                    state: CallState::Idle,
                    transitions: Vec::new(),
                    ended_at: None,
                    recording_path: None,
                }),
            }),
        );
        Ok(call_id)
    }

    pub fn record_transition(&self, call_id: &str, transition: &StateTransition) {
        if let Some(entry) = self.calls.read().get(call_id) {
            let mut live = entry.live.write();
            live.state = transition.to;
            live.transitions.push(transition.clone());
        }
    }

    /// Mark a call finished. Later calls for the same id only fill in a
    /// missing recording path.
    pub fn complete(&self, call_id: &str, final_state: CallState, recording_path: Option<PathBuf>) {
        if let Some(entry) = self.calls.read().get(call_id) {
            let mut live = entry.live.write();
            if live.ended_at.is_none() {
                live.ended_at = Some(Utc::now());
                live.state = final_state;
            }
            if live.recording_path.is_none() {
                live.recording_path = recording_path;
            }
        }
    }

    pub fn snapshot(&self, call_id: &str) -> Option<CallSnapshot> {
        self.calls.read().get(call_id).map(|entry| entry.snapshot())
    }

    /// All calls, oldest first.
    pub fn snapshots(&self) -> Vec<CallSnapshot> {
        let mut all: Vec<CallSnapshot> =
            self.calls.read().values().map(|entry| entry.snapshot()).collect();
        all.sort_by_key(|snapshot| snapshot.created_at);
        all
    }

    pub fn active_count(&self) -> usize {
        self.calls.read().values().filter(|entry| entry.is_live()).count()
    }

    pub fn len(&self) -> usize {
        self.calls.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.read().is_empty()
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent_calls
    }

    pub fn remove(&self, call_id: &str) -> bool {
        self.calls.write().remove(call_id).is_some()
    }

    /// Drop finished calls that ended more than `max_age_seconds` ago.
    pub fn cleanup_old(&self, max_age_seconds: u64) -> usize {
        let now = Utc::now();
        let mut calls = self.calls.write();
        let before = calls.len();
        calls.retain(|_, entry| match entry.live.read().ended_at {
            Some(ended) => now.signed_duration_since(ended).num_seconds() < max_age_seconds as i64,
            None => true,
        });
        before - calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> Contact {
        Contact {
            id: "c-1".to_string(),
            name: "Ada Lovelace".to_string(),
            phone_number: "+15550100".to_string(),
            variables: HashMap::new(),
        }
    }

    fn transition(from: CallState, to: CallState) -> StateTransition {
        StateTransition {
            timestamp: Utc::now(),
            from,
            to,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn test_concurrency_limit_counts_live_calls() {
        let registry = CallRegistry::new(1);
        let first = registry.register(None, &contact()).unwrap();
        assert!(registry.register(None, &contact()).is_err());

        registry.complete(&first, CallState::Ended, None);
        assert_eq!(registry.active_count(), 0);
        assert!(registry.register(None, &contact()).is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = CallRegistry::new(5);
        registry.register(Some("call-1".to_string()), &contact()).unwrap();
        assert!(registry.register(Some("call-1".to_string()), &contact()).is_err());
    }

    #[test]
    fn test_snapshot_tracks_transitions() {
        let registry = CallRegistry::new(5);
        let id = registry.register(None, &contact()).unwrap();
        registry.record_transition(&id, &transition(CallState::Idle, CallState::Dialing));
        registry.record_transition(&id, &transition(CallState::Dialing, CallState::Connected));

        let snapshot = registry.snapshot(&id).unwrap();
        assert_eq!(snapshot.state, CallState::Connected);
        assert_eq!(snapshot.transitions.len(), 2);
        assert!(snapshot.ended_at.is_none());

        registry.complete(&id, CallState::Ended, Some(PathBuf::from("/tmp/a.wav")));
        registry.complete(&id, CallState::Failed, None);
        let snapshot = registry.snapshot(&id).unwrap();
        assert_eq!(snapshot.state, CallState::Ended);
        assert_eq!(snapshot.recording_path, Some(PathBuf::from("/tmp/a.wav")));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "ended");
    }

    #[test]
    fn test_cleanup_keeps_live_calls() {
        let registry = CallRegistry::new(5);
        let live = registry.register(None, &contact()).unwrap();
        let done = registry.register(None, &contact()).unwrap();
        registry.complete(&done, CallState::Failed, None);

        assert_eq!(registry.cleanup_old(3_600), 0);
        assert_eq!(registry.cleanup_old(0), 1);
        assert!(registry.snapshot(&live).is_some());
        assert!(registry.snapshot(&done).is_none());
    }
}
