//! # Conversation Wire Protocol
//!
//! JSON messages exchanged with the conversational voice service. Every
//! inbound message carries a `type` discriminator; the payload sits under a
//! per-type `*_event` object.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

use crate::error::{AppError, AppResult};

/// Messages sent by the voice service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    ConversationInitiationMetadata {
        #[serde(default)]
        conversation_initiation_metadata_event: Option<serde_json::Value>,
    },
    Audio {
        audio_event: AudioEvent,
    },
    UserTranscript {
        user_transcription_event: UserTranscriptionEvent,
    },
    AgentResponse {
        agent_response_event: AgentResponseEvent,
    },
    Interruption {
        #[serde(default)]
        interruption_event: Option<serde_json::Value>,
    },
    ModeChange {
        mode_change_event: ModeChangeEvent,
    },
    Ping {
        ping_event: PingEvent,
    },
    Pong {
        #[serde(default)]
        event_id: Option<u64>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AudioEvent {
    pub audio_base_64: String,
    #[serde(default)]
    pub audio_end_ms: Option<u64>,
    #[serde(default)]
    pub event_id: Option<u64>,
}

impl AudioEvent {
    pub fn decode(&self) -> AppResult<Vec<u8>> {
        BASE64
            .decode(self.audio_base_64.as_bytes())
            .map_err(|e| AppError::Session(format!("Invalid base64 audio: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserTranscriptionEvent {
    pub user_transcript: String,
    #[serde(default = "default_final")]
    pub is_final: bool,
    #[serde(default)]
    pub confidence: Option<f32>,
}

fn default_final() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentResponseEvent {
    pub agent_response: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModeChangeEvent {
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PingEvent {
    pub event_id: u64,
    #[serde(default)]
    pub ping_ms: Option<u64>,
}

/// Messages sent to the voice service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    ClientData {
        #[serde(rename = "type")]
        kind: &'static str,
        dynamic_variables: HashMap<String, String>,
    },
    UserAudioChunk {
        user_audio_chunk: String,
    },
    Pong {
        #[serde(rename = "type")]
        kind: &'static str,
        event_id: u64,
    },
}

impl OutboundMessage {
    /// Per-call context sent right after initiation metadata arrives.
    pub fn client_data(dynamic_variables: HashMap<String, String>) -> Self {
        Self::ClientData {
            kind: "conversation_initiation_client_data",
            dynamic_variables,
        }
    }

    pub fn audio(pcm: &[u8]) -> Self {
        Self::UserAudioChunk {
            user_audio_chunk: BASE64.encode(pcm),
        }
    }

    pub fn pong(event_id: u64) -> Self {
        Self::Pong {
            kind: "pong",
            event_id,
        }
    }

    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse one text frame from the service.
pub fn parse_inbound(text: &str) -> AppResult<InboundMessage> {
    serde_json::from_str(text)
        .map_err(|e| AppError::Session(format!("Unparseable session message: {}", e)))
}

/// Matches agent text against a closing-phrase vocabulary.
#[derive(Debug, Clone)]
pub struct ClosingPhrases {
    phrases: Vec<String>,
}

impl ClosingPhrases {
    pub fn new(phrases: &[String]) -> Self {
        Self {
            phrases: phrases
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        let normalized: String = text
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
            .collect();
        let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
        self.phrases.iter().any(|p| normalized.contains(p.as_str()))
    }
}

/// Shape of the client data message, for logging.
pub fn describe_client_data(dynamic_variables: &HashMap<String, String>) -> serde_json::Value {
    json!({
        "type": "conversation_initiation_client_data",
        "variables": dynamic_variables.keys().collect::<Vec<_>>(),
    })
}
