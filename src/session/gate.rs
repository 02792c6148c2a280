//! # Readiness Gate
//!
//! Decides what happens to outbound audio depending on where the session is
//! in its lifecycle:
//!
//! ```text
//! Disconnected → Connecting → AwaitingMetadata → Ready
//!                                  ↑                │
//!                            Reconnecting{n} ←──────┘ (drop)
//! any → Ended
//! ```
//!
//! Audio is sent only in `Ready`. Before the first connection becomes ready it
//! is buffered (bounded, oldest dropped first). From a reconnect until the new
//! connection is ready, audio is dropped instead, so nothing captured around a
//! drop reaches the fresh conversation. Every reconnect bumps a generation
//! counter; a delayed `mark_ready` from an older connection is ignored.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    AwaitingMetadata,
    Ready,
    Reconnecting { attempt: u32 },
    Ended,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Disconnected => "disconnected",
            SessionPhase::Connecting => "connecting",
            SessionPhase::AwaitingMetadata => "awaiting_metadata",
            SessionPhase::Ready => "ready",
            SessionPhase::Reconnecting { .. } => "reconnecting",
            SessionPhase::Ended => "ended",
        }
    }
}

/// What `offer` did with a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDecision {
    /// Send now.
    Send(Vec<u8>),
    /// Held until the session is ready.
    Buffered,
    /// Session ended or reconnecting; dropped.
    Discarded,
}

#[derive(Debug)]
pub struct ReadinessGate {
    phase: SessionPhase,
    pending: VecDeque<Vec<u8>>,
    max_pending: usize,
    dropped_pending: u64,
    generation: u64,
    reconnecting: bool,
}

impl ReadinessGate {
    pub fn new(max_pending: usize) -> Self {
        Self {
            phase: SessionPhase::Disconnected,
            pending: VecDeque::new(),
            max_pending: max_pending.max(1),
            dropped_pending: 0,
            generation: 0,
            reconnecting: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_ready(&self) -> bool {
        self.phase == SessionPhase::Ready
    }

    pub fn is_ended(&self) -> bool {
        self.phase == SessionPhase::Ended
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Chunks dropped because the pre-ready buffer overflowed.
    pub fn dropped_pending(&self) -> u64 {
        self.dropped_pending
    }

    pub fn begin_connect(&mut self) {
        if !self.is_ended() {
            self.phase = SessionPhase::Connecting;
        }
    }

    /// Socket is open; waiting for initiation metadata.
    pub fn opened(&mut self) {
        if !self.is_ended() {
            self.phase = SessionPhase::AwaitingMetadata;
        }
    }

    pub fn offer(&mut self, chunk: Vec<u8>) -> SendDecision {
        match self.phase {
            SessionPhase::Ended => SendDecision::Discarded,
            SessionPhase::Ready => SendDecision::Send(chunk),
            _ if self.reconnecting => SendDecision::Discarded,
            _ => {
                if self.pending.len() >= self.max_pending {
                    self.pending.pop_front();
                    self.dropped_pending += 1;
                }
                self.pending.push_back(chunk);
                SendDecision::Buffered
            }
        }
    }

    /// Open the gate for `generation` and hand back the buffered chunks in order.
    ///
    /// Returns `None` when the generation is stale or the session already
    /// ended, in which case nothing changes.
    pub fn mark_ready(&mut self, generation: u64) -> Option<Vec<Vec<u8>>> {
        if generation != self.generation || self.is_ended() {
            return None;
        }
        self.phase = SessionPhase::Ready;
        self.reconnecting = false;
        Some(self.pending.drain(..).collect())
    }

    /// Close the gate for a reconnect attempt and discard buffered audio.
    /// Audio offered until the next `mark_ready` is dropped.
    ///
    /// Returns how many chunks were discarded.
    pub fn reset_for_reconnect(&mut self, attempt: u32) -> usize {
        if self.is_ended() {
            return 0;
        }
        self.generation += 1;
        self.phase = SessionPhase::Reconnecting { attempt };
        self.reconnecting = true;
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }

    /// Terminal. Drops anything still buffered.
    pub fn end(&mut self) {
        self.phase = SessionPhase::Ended;
        self.generation += 1;
        self.pending.clear();
    }
}
