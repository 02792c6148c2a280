//! # Capture Gate
//!
//! Decides, frame by frame, whether captured call audio is forwarded to the
//! voice session.
//!
//! ## Gates (applied in order):
//! 1. **Format**: frames must hold whole 16-bit samples
//! 2. **Minimum size**: tiny frames are silence or capture artifacts
//! 3. **Playback echo**: for a short window after agent audio finished
//!    playing, captured audio is mostly the agent's own voice bleeding back
//!    into the capture path; forwarding it would make the agent interrupt
//!    itself, so it is dropped

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// One frame of captured call audio.
///
/// Created by the capture relay, owned by the capture queue until the single
/// consumer takes it.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub buffer: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl AudioChunk {
    pub fn new(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            timestamp: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Outcome of running a frame through the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Forward,
    TooSmall,
    PlaybackEcho,
    Invalid(String),
}

/// Counters for dropped and forwarded frames.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    pub forwarded: u64,
    pub too_small: u64,
    pub echo: u64,
    pub invalid: u64,
}

#[derive(Debug)]
pub struct CaptureGate {
    min_chunk_bytes: usize,
    window: Duration,
    last_playback_finished: Option<Instant>,
    stats: GateStats,
}

impl CaptureGate {
    pub fn new(min_chunk_bytes: usize, window: Duration) -> Self {
        Self {
            min_chunk_bytes,
            window,
            last_playback_finished: None,
            stats: GateStats::default(),
        }
    }

    /// Record that an agent audio item finished (or was cut off) at `at`.
    pub fn mark_playback_finished(&mut self, at: Instant) {
        self.last_playback_finished = Some(at);
    }

    pub fn last_playback_finished(&self) -> Option<Instant> {
        self.last_playback_finished
    }

    /// Whether the echo window is still open at `now`.
    pub fn in_echo_window(&self, now: Instant) -> bool {
        match self.last_playback_finished {
            Some(finished) => now.saturating_duration_since(finished) < self.window,
            None => false,
        }
    }

    /// Validate a frame's structure.
    pub fn validate_frame(data: &[u8]) -> Result<(), String> {
        if data.is_empty() {
            return Err("Audio data is empty".to_string());
        }
        if data.len() % 2 != 0 {
            return Err("Audio data length must be even for 16-bit samples".to_string());
        }
        Ok(())
    }

    /// Run a frame through every gate and update the counters.
    pub fn check(&mut self, data: &[u8], now: Instant) -> GateVerdict {
        if let Err(reason) = Self::validate_frame(data) {
            self.stats.invalid += 1;
            return GateVerdict::Invalid(reason);
        }

        if data.len() < self.min_chunk_bytes {
            self.stats.too_small += 1;
            return GateVerdict::TooSmall;
        }

        if self.in_echo_window(now) {
            self.stats.echo += 1;
            return GateVerdict::PlaybackEcho;
        }

        self.stats.forwarded += 1;
        GateVerdict::Forward
    }

    pub fn stats(&self) -> GateStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(len: usize) -> Vec<u8> {
        vec![1u8; len]
    }

    #[test]
    fn test_small_frames_never_forwarded() {
        let mut gate = CaptureGate::new(320, Duration::from_millis(200));
        let now = Instant::now();

        assert_eq!(gate.check(&frame(318), now), GateVerdict::TooSmall);
        gate.mark_playback_finished(now);
        assert_eq!(
            gate.check(&frame(100), now + Duration::from_secs(5)),
            GateVerdict::TooSmall
        );
        assert_eq!(gate.stats().too_small, 2);
        assert_eq!(gate.stats().forwarded, 0);
    }

    #[test]
    fn test_echo_window_then_forward() {
        let mut gate = CaptureGate::new(320, Duration::from_millis(200));
        let finished = Instant::now();
        gate.mark_playback_finished(finished);

        assert_eq!(gate.check(&frame(640), finished), GateVerdict::PlaybackEcho);
        assert_eq!(
            gate.check(&frame(640), finished + Duration::from_millis(199)),
            GateVerdict::PlaybackEcho
        );
        assert_eq!(
            gate.check(&frame(640), finished + Duration::from_millis(200)),
            GateVerdict::Forward
        );
        assert_eq!(gate.stats().echo, 2);
        assert_eq!(gate.stats().forwarded, 1);
    }

    #[test]
    fn test_no_playback_means_open_gate() {
        let mut gate = CaptureGate::new(320, Duration::from_millis(200));
        assert!(!gate.in_echo_window(Instant::now()));
        assert_eq!(gate.check(&frame(320), Instant::now()), GateVerdict::Forward);
    }

    #[test]
    fn test_invalid_frames() {
        let mut gate = CaptureGate::new(0, Duration::from_millis(200));
        assert!(matches!(gate.check(&[], Instant::now()), GateVerdict::Invalid(_)));
        assert!(matches!(gate.check(&frame(641), Instant::now()), GateVerdict::Invalid(_)));
        assert_eq!(gate.stats().invalid, 2);
    }
}
