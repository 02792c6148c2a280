//! Per-call conversation log.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Agent,
    Contact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_chunk_id: Option<u64>,
}

/// Append-only, in event-arrival order. Cloning shares the log.
#[derive(Debug, Clone, Default)]
pub struct TranscriptLog {
    turns: Arc<Mutex<Vec<ConversationTurn>>>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, speaker: Speaker, message: impl Into<String>, audio_chunk_id: Option<u64>) {
        let message = message.into();
        if message.trim().is_empty() {
            return;
        }
        self.turns.lock().push(ConversationTurn {
            speaker,
            message,
            timestamp: Utc::now(),
            audio_chunk_id,
        });
    }

    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.turns.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.turns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turns_keep_arrival_order() {
        let log = TranscriptLog::new();
        log.append(Speaker::Agent, "Hi, is this Ada?", Some(3));
        log.append(Speaker::Contact, "Yes, speaking.", None);
        log.append(Speaker::Contact, "   ", None);

        let turns = log.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].speaker, Speaker::Agent);
        assert_eq!(turns[0].audio_chunk_id, Some(3));
        assert_eq!(turns[1].message, "Yes, speaking.");

        let json = serde_json::to_value(&turns[1]).unwrap();
        assert_eq!(json["speaker"], "contact");
        assert!(json.get("audio_chunk_id").is_none());
    }
}
