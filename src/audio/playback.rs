//! # Agent Audio Playback
//!
//! The queue agent audio waits in, and the sinks that make it audible on the
//! call.
//!
//! ## Sinks:
//! - [`ProcessSink`]: pipes raw PCM into an external player (e.g. `paplay --raw`)
//!   whose output device is routed into the call
//! - [`RelaySink`]: pushes PCM back to the page for in-page playback
//! - [`NullSink`]: discards audio (recording-only runs)
//!
//! Sinks only write; pacing is the player task's job.

use crate::config::StreamConfig;
use crate::error::{AppError, AppResult};
use crate::relay::hub::{PageCommand, RelayHub};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One agent audio chunk waiting to be played.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackQueueItem {
    pub chunk_id: u64,
    pub buffer: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl PlaybackQueueItem {
    pub fn new(chunk_id: u64, buffer: Vec<u8>) -> Self {
        Self {
            chunk_id,
            buffer,
            timestamp: Utc::now(),
        }
    }
}

/// Strict FIFO of pending playback.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    items: VecDeque<PlaybackQueueItem>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: PlaybackQueueItem) {
        self.items.push_back(item);
    }

    pub fn pop(&mut self) -> Option<PlaybackQueueItem> {
        self.items.pop_front()
    }

    /// Drop everything queued, returning how many items were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Destination for agent audio.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Write one chunk of PCM to the output.
    async fn play(&self, pcm: &[u8]) -> AppResult<()>;

    /// Cut off whatever is currently sounding. The sink stays usable.
    async fn interrupt(&self);

    /// Release the output for good.
    async fn stop(&self);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn play(&self, _pcm: &[u8]) -> AppResult<()> {
        Ok(())
    }

    async fn interrupt(&self) {}

    async fn stop(&self) {}
}

/// Feeds PCM to a long-running player process over stdin.
///
/// The process is spawned lazily on the first chunk. An interruption kills it
/// (the OS buffer of the pipe would otherwise keep playing) and the next chunk
/// spawns a fresh one.
pub struct ProcessSink {
    command: Vec<String>,
    child: Mutex<Option<Child>>,
    stopped: AtomicBool,
}

impl ProcessSink {
    pub fn new(command: Vec<String>) -> AppResult<Self> {
        if command.is_empty() {
            return Err(AppError::ConfigError(
                "Playback command cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            command,
            child: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    fn spawn(&self) -> AppResult<Child> {
        let child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::Audio(format!("Failed to spawn {}: {}", self.command[0], e))
            })?;
        info!("Started playback process: {}", self.command.join(" "));
        Ok(child)
    }

    async fn kill_current(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!("Playback process already gone: {}", e);
            }
        }
    }
}

#[async_trait]
impl AudioSink for ProcessSink {
    async fn play(&self, pcm: &[u8]) -> AppResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut guard = self.child.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn()?);
        }

        let write = match guard.as_mut().and_then(|c| c.stdin.as_mut()) {
            Some(stdin) => stdin.write_all(pcm).await,
            None => {
                *guard = None;
                return Err(AppError::Audio("Playback process has no stdin".to_string()));
            }
        };

        if let Err(e) = write {
            warn!("Playback process write failed, will respawn: {}", e);
            *guard = None;
            return Err(AppError::Audio(format!("Playback write failed: {}", e)));
        }
        Ok(())
    }

    async fn interrupt(&self) {
        self.kill_current().await;
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.kill_current().await;
    }
}

/// Sends agent audio to the page attached to a call.
pub struct RelaySink {
    hub: RelayHub,
    call_id: String,
}

impl RelaySink {
    pub fn new(hub: RelayHub, call_id: impl Into<String>) -> Self {
        Self {
            hub,
            call_id: call_id.into(),
        }
    }
}

#[async_trait]
impl AudioSink for RelaySink {
    async fn play(&self, pcm: &[u8]) -> AppResult<()> {
        if self
            .hub
            .send_to_page(&self.call_id, PageCommand::Audio(pcm.to_vec()))
        {
            Ok(())
        } else {
            Err(AppError::Audio(format!(
                "No page attached for call {}",
                self.call_id
            )))
        }
    }

    async fn interrupt(&self) {
        self.hub
            .send_to_page(&self.call_id, PageCommand::ClearPlayback);
    }

    async fn stop(&self) {
        self.hub
            .send_to_page(&self.call_id, PageCommand::ClearPlayback);
    }
}

/// Plays every chunk on several sinks. Errors from one sink do not stop the others.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AudioSink>>,
}

#[async_trait]
impl AudioSink for FanoutSink {
    async fn play(&self, pcm: &[u8]) -> AppResult<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.play(pcm).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn interrupt(&self) {
        for sink in &self.sinks {
            sink.interrupt().await;
        }
    }

    async fn stop(&self) {
        for sink in &self.sinks {
            sink.stop().await;
        }
    }
}

/// Build the sink configured for a call.
pub fn build_sink(
    config: &StreamConfig,
    hub: &RelayHub,
    call_id: &str,
) -> AppResult<Arc<dyn AudioSink>> {
    let mut sinks: Vec<Arc<dyn AudioSink>> = Vec::new();
    if !config.playback_command.is_empty() {
        sinks.push(Arc::new(ProcessSink::new(config.playback_command.clone())?));
    }
    if config.relay_playback {
        sinks.push(Arc::new(RelaySink::new(hub.clone(), call_id)));
    }

    Ok(match sinks.len() {
        0 => Arc::new(NullSink),
        1 => sinks.remove(0),
        _ => Arc::new(FanoutSink { sinks }),
    })
}
