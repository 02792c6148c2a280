//! # Recording Buffer
//!
//! Accumulates every audio segment heard on a call (captured caller audio and
//! the agent's replies) in arrival order, so the call can be finalized into a
//! single recording file.
//!
//! ## Key Features:
//! - **Ordered**: segments keep insertion order, which is the conversation order
//! - **Format validation**: rejects frames that are not whole 16-bit samples
//! - **Thread safety**: the capture consumer and the session event task both append

use crate::audio::transcoder::PcmFormat;
use crate::error::{AppError, AppResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Where a recorded segment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentSource {
    /// Captured from the call (the contact's side)
    Capture,
    /// Synthesized by the voice agent
    Agent,
}

#[derive(Debug, Clone)]
struct Segment {
    source: SegmentSource,
    pcm: Vec<u8>,
}

#[derive(Debug, Default)]
struct BufferState {
    segments: Vec<Segment>,
    total_bytes: usize,
    rejected: usize,
}

/// Append-only audio accumulation for one call.
///
/// Cloning shares the same underlying buffer.
#[derive(Debug, Clone)]
pub struct RecordingBuffer {
    state: Arc<Mutex<BufferState>>,
    format: PcmFormat,
}

impl RecordingBuffer {
    pub fn new(format: PcmFormat) -> Self {
        Self {
            state: Arc::new(Mutex::new(BufferState::default())),
            format,
        }
    }

    /// Append one PCM segment.
    ///
    /// ## Error Handling:
    /// Empty or odd-length data is rejected (and counted) instead of
    /// corrupting the sample alignment of everything recorded after it.
    pub fn append(&self, source: SegmentSource, data: &[u8]) -> AppResult<()> {
        let mut state = self.state.lock();
        if data.is_empty() || data.len() % 2 != 0 {
            state.rejected += 1;
            return Err(AppError::Audio(format!(
                "Refusing to record {} byte segment: not whole 16-bit samples",
                data.len()
            )));
        }

        state.total_bytes += data.len();
        state.segments.push(Segment {
            source,
            pcm: data.to_vec(),
        });
        Ok(())
    }

    /// Number of segments recorded so far.
    pub fn len(&self) -> usize {
        self.state.lock().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().segments.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    pub fn rejected(&self) -> usize {
        self.state.lock().rejected
    }

    /// Bytes recorded from one side of the call.
    pub fn bytes_from(&self, source: SegmentSource) -> usize {
        self.state
            .lock()
            .segments
            .iter()
            .filter(|s| s.source == source)
            .map(|s| s.pcm.len())
            .sum()
    }

    /// Duration of everything recorded so far.
    pub fn duration(&self) -> Duration {
        self.format.estimate_duration(self.total_bytes())
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Copy of the recorded segments in arrival order.
    pub fn segments(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .segments
            .iter()
            .map(|s| s.pcm.clone())
            .collect()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.segments.clear();
        state.total_bytes = 0;
    }
}
