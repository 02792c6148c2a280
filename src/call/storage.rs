//! Persistence of finished calls.
//!
//! The data layer proper lives outside this service; [`CallStore`] is the
//! seam. Each method is called at most once per finalized call.

use crate::error::AppResult;
use crate::stream::transcript::ConversationTurn;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait CallStore: Send + Sync {
    async fn create_call_recording(
        &self,
        call_id: &str,
        path: &Path,
        duration: Duration,
    ) -> AppResult<()>;

    async fn create_conversation_transcript(
        &self,
        call_id: &str,
        turns: &[ConversationTurn],
    ) -> AppResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecording {
    pub call_id: String,
    pub path: PathBuf,
    pub duration_seconds: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTranscript {
    pub call_id: String,
    pub turns: Vec<ConversationTurn>,
    pub created_at: DateTime<Utc>,
}

/// Writes one JSON document per record into a directory.
///
/// - `<call_id>.recording.json`
/// - `<call_id>.transcript.json`
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn recording_file(&self, call_id: &str) -> PathBuf {
        self.dir.join(format!("{}.recording.json", call_id))
    }

    pub fn transcript_file(&self, call_id: &str) -> PathBuf {
        self.dir.join(format!("{}.transcript.json", call_id))
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> AppResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(path, body).await?;
        debug!("Wrote {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl CallStore for JsonFileStore {
    async fn create_call_recording(
        &self,
        call_id: &str,
        path: &Path,
        duration: Duration,
    ) -> AppResult<()> {
        let record = StoredRecording {
            call_id: call_id.to_string(),
            path: path.to_path_buf(),
            duration_seconds: duration.as_secs_f64(),
            created_at: Utc::now(),
        };
        self.write_json(&self.recording_file(call_id), &record).await
    }

    async fn create_conversation_transcript(
        &self,
        call_id: &str,
        turns: &[ConversationTurn],
    ) -> AppResult<()> {
        let record = StoredTranscript {
            call_id: call_id.to_string(),
            turns: turns.to_vec(),
            created_at: Utc::now(),
        };
        self.write_json(&self.transcript_file(call_id), &record).await
    }
}

/// Keeps everything in memory. Handy for embedding and tests.
#[derive(Default)]
pub struct InMemoryStore {
    recordings: Mutex<Vec<StoredRecording>>,
    transcripts: Mutex<HashMap<String, Vec<ConversationTurn>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recordings(&self) -> Vec<StoredRecording> {
        self.recordings.lock().clone()
    }

    pub fn transcript(&self, call_id: &str) -> Option<Vec<ConversationTurn>> {
        self.transcripts.lock().get(call_id).cloned()
    }

    pub fn transcript_count(&self) -> usize {
        self.transcripts.lock().len()
    }
}

#[async_trait]
impl CallStore for InMemoryStore {
    async fn create_call_recording(
        &self,
        call_id: &str,
        path: &Path,
        duration: Duration,
    ) -> AppResult<()> {
        self.recordings.lock().push(StoredRecording {
            call_id: call_id.to_string(),
            path: path.to_path_buf(),
            duration_seconds: duration.as_secs_f64(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn create_conversation_transcript(
        &self,
        call_id: &str,
        turns: &[ConversationTurn],
    ) -> AppResult<()> {
        self.transcripts
            .lock()
            .insert(call_id.to_string(), turns.to_vec());
        Ok(())
    }
}
