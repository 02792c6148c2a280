//! # Watchdog Timers
//!
//! Per-call timer bookkeeping. Every timer a call arms lives in one
//! [`TimerSet`] so a single `cancel_all` releases all of them.
//!
//! Timers only decide *when*; the action they trigger runs on its own
//! detached task (see [`spawn_after`]), so cancelling the timer set from
//! inside that action cannot abort it halfway.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Dialing,
    Ringing,
    Inactivity,
    MaxDuration,
    Voicemail,
    Poll,
}

/// Owned list of armed timers.
#[derive(Debug, Default)]
pub struct TimerSet {
    timers: HashMap<TimerKind, JoinHandle<()>>,
    closed: bool,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timer, replacing (and aborting) any timer of the same kind.
    ///
    /// Once the set is closed new timers are aborted immediately.
    pub fn arm(&mut self, kind: TimerKind, handle: JoinHandle<()>) {
        if self.closed {
            handle.abort();
            return;
        }
        if let Some(old) = self.timers.insert(kind, handle) {
            old.abort();
        }
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.timers.remove(&kind) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every timer and refuse new ones.
    ///
    /// Returns how many timers were still pending.
    pub fn cancel_all(&mut self) -> usize {
        self.closed = true;
        let mut pending = 0;
        for (_, handle) in self.timers.drain() {
            if !handle.is_finished() {
                pending += 1;
            }
            handle.abort();
        }
        pending
    }
}

/// Wait `delay`, then run `action` on a detached task.
pub fn spawn_after<F>(delay: Duration, action: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        tokio::spawn(action);
    })
}

/// Last time anything happened on a call.
///
/// Shared between the monitor (state changes) and the stream handler
/// (audio in either direction); the inactivity watchdog reads it.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    last: Arc<Mutex<Instant>>,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    pub fn last(&self) -> Instant {
        *self.last.lock()
    }

    pub fn elapsed(&self) -> Duration {
        self.last().elapsed()
    }
}
