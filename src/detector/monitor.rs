//! # Call Monitor
//!
//! Watches one dialed call from `Dialing` to a terminal state.
//!
//! ## How it works:
//! 1. `start()` enters `Dialing`, arms the watchdogs and waits the settle window
//! 2. One definitive sample decides `Connected` (control visible) or
//!    `Failed` (nothing to hang up, monitoring stops)
//! 3. While live, the page is sampled every poll interval; the hang-up control
//!    disappearing is what ends the call
//! 4. Any watchdog expiry force-aborts: hang up, `Failed`, stop
//!
//! ## Observers:
//! - `on_state_change` registers a callback; errors and panics are caught and logged
//! - `subscribe` hands out a broadcast receiver of transitions
//!
//! All timers of a call live in one [`TimerSet`]; `stop()` cancels every one.

use crate::config::DetectorConfig;
use crate::detector::hangup::{HangupController, HangupOutcome};
use crate::detector::signals::{CallSignals, DomSignalSampler, SignalSampler};
use crate::detector::state::{
    classify, classify_settle, CallState, CallStateMachine, StateTransition,
};
use crate::detector::watchdog::{spawn_after, ActivityClock, TimerKind, TimerSet};
use crate::driver::PageDriver;
use crate::error::{AppError, AppResult};
use crate::stream::handler::CallTerminator;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Observer invoked synchronously for every transition, in order.
pub type StateCallback = Box<dyn Fn(&StateTransition) -> anyhow::Result<()> + Send + Sync>;

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

struct Inner {
    call_id: String,
    config: DetectorConfig,
    sampler: Arc<dyn SignalSampler>,
    hangup: HangupController,
    machine: Mutex<CallStateMachine>,
    timers: Mutex<TimerSet>,
    /// Serializes "transition + notify" so observers see transitions in order.
    emit_lock: Mutex<()>,
    callbacks: RwLock<Vec<StateCallback>>,
    transitions: broadcast::Sender<StateTransition>,
    activity: ActivityClock,
    started: AtomicBool,
    stopped: AtomicBool,
    stopped_tx: watch::Sender<bool>,
}

/// Call-state monitor for one call attempt. Cloning shares the same monitor.
#[derive(Clone)]
pub struct CallMonitor {
    inner: Arc<Inner>,
}

impl CallMonitor {
    pub fn new(
        call_id: impl Into<String>,
        config: DetectorConfig,
        driver: Arc<dyn PageDriver>,
        sampler: Arc<dyn SignalSampler>,
        activity: ActivityClock,
    ) -> Self {
        let hangup = HangupController::new(
            driver,
            sampler.clone(),
            config.signals.clone(),
            config.hangup_verify(),
        );
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        let (stopped_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                call_id: call_id.into(),
                config,
                sampler,
                hangup,
                machine: Mutex::new(CallStateMachine::new()),
                timers: Mutex::new(TimerSet::new()),
                emit_lock: Mutex::new(()),
                callbacks: RwLock::new(Vec::new()),
                transitions,
                activity,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                stopped_tx,
            }),
        }
    }

    /// Monitor backed by DOM sampling through the page driver.
    pub fn for_page(
        call_id: impl Into<String>,
        config: DetectorConfig,
        driver: Arc<dyn PageDriver>,
        activity: ActivityClock,
    ) -> Self {
        let sampler = Arc::new(DomSignalSampler::new(
            driver.clone(),
            config.signals.clone(),
        ));
        Self::new(call_id, config, driver, sampler, activity)
    }

    pub fn call_id(&self) -> &str {
        &self.inner.call_id
    }

    pub fn state(&self) -> CallState {
        self.inner.machine.lock().state()
    }

    pub fn history(&self) -> Vec<StateTransition> {
        self.inner.machine.lock().history().to_vec()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn activity(&self) -> ActivityClock {
        self.inner.activity.clone()
    }

    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(&StateTransition) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.callbacks.write().push(Box::new(callback));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.inner.transitions.subscribe()
    }

    /// Dial-side entry point: watch the call from `Dialing` through the settle check.
    ///
    /// Returns the state after the settle sample.
    pub async fn start(&self) -> AppResult<CallState> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::Internal(format!(
                "Monitor for call {} already started",
                self.inner.call_id
            )));
        }
        if self.is_stopped() {
            return Ok(self.state());
        }

        info!(call_id = %self.inner.call_id, "Monitoring call");
        self.inner.apply(CallState::Dialing, "dialing started");
        self.inner.arm_watchdogs();

        let mut stopped = self.inner.stopped_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(self.inner.config.settle()) => {}
            _ = stopped_signal(&mut stopped) => return Ok(self.state()),
        }

        if self.state().is_terminal() {
            return Ok(self.state());
        }

        let signals = match self.inner.sampler.sample().await {
            Ok(signals) => signals,
            Err(e) => {
                warn!(call_id = %self.inner.call_id, "Settle sample failed: {}", e);
                CallSignals::default()
            }
        };

        let (next, reason) = classify_settle(&signals, self.inner.config.detect_ringing);
        match next {
            CallState::Failed => {
                // Nothing on screen, so nothing to hang up.
                self.inner.apply(CallState::Failed, reason);
                self.inner.stop();
            }
            _ => {
                self.inner.apply(next, reason);
                self.inner.start_polling();
            }
        }

        Ok(self.state())
    }

    /// Cancel polling and every watchdog. Idempotent; safe before `start()`.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Run the hang-up escalation (at most once per call).
    pub async fn hangup_call(&self) -> HangupOutcome {
        self.inner.hangup.hang_up().await
    }

    /// Hang up, mark the call `Failed` and stop.
    pub async fn force_abort(&self, reason: &str) -> CallState {
        self.inner.force_abort(reason).await
    }

    /// Hang up because the conversation is over, mark the call `Ended` and stop.
    pub async fn end_call(&self, reason: &str) -> CallState {
        self.inner.end_call(reason).await
    }

    /// Wait until the monitor has stopped and return the final state.
    pub async fn finished(&self) -> CallState {
        let mut stopped = self.inner.stopped_tx.subscribe();
        stopped_signal(&mut stopped).await;
        self.state()
    }
}

/// Resolves once the monitor's stop flag is set (immediately if it already is).
async fn stopped_signal(stopped: &mut watch::Receiver<bool>) {
    let _ = stopped.wait_for(|s| *s).await;
}

#[async_trait]
impl CallTerminator for CallMonitor {
    async fn hang_up(&self, reason: &str) {
        self.end_call(reason).await;
    }
}

impl Inner {
    /// Apply a transition and notify observers. Refused moves are silent.
    fn apply(self: &Arc<Self>, to: CallState, reason: &str) -> Option<StateTransition> {
        let _guard = self.emit_lock.lock();
        let transition = self.machine.lock().transition(to, reason)?;
        self.activity.touch();

        info!(
            call_id = %self.call_id,
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            "Call state changed"
        );

        match to {
            CallState::Connected => {
                let mut timers = self.timers.lock();
                timers.cancel(TimerKind::Dialing);
                timers.cancel(TimerKind::Ringing);
            }
            CallState::Ringing => {
                let mut timers = self.timers.lock();
                timers.cancel(TimerKind::Dialing);
                let inner = self.clone();
                timers.arm(
                    TimerKind::Ringing,
                    spawn_after(self.config.ringing_timeout(), async move {
                        inner.force_abort("ringing timeout").await;
                    }),
                );
            }
            CallState::Voicemail => {
                let inner = self.clone();
                self.timers.lock().arm(
                    TimerKind::Voicemail,
                    spawn_after(self.config.voicemail_timeout(), async move {
                        inner.end_call("voicemail timeout").await;
                    }),
                );
            }
            _ => {}
        }

        for callback in self.callbacks.read().iter() {
            match catch_unwind(AssertUnwindSafe(|| callback(&transition))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(call_id = %self.call_id, "State callback failed: {}", e),
                Err(_) => error!(call_id = %self.call_id, "State callback panicked"),
            }
        }
        // No receivers is fine.
        let _ = self.transitions.send(transition.clone());

        Some(transition)
    }

    fn arm_watchdogs(self: &Arc<Self>) {
        let mut timers = self.timers.lock();

        let inner = self.clone();
        timers.arm(
            TimerKind::Dialing,
            spawn_after(self.config.dialing_timeout(), async move {
                inner.force_abort("dialing timeout").await;
            }),
        );

        let inner = self.clone();
        timers.arm(
            TimerKind::MaxDuration,
            spawn_after(self.config.max_call_duration(), async move {
                inner.force_abort("max call duration exceeded").await;
            }),
        );

        let inner = self.clone();
        let timeout = self.config.inactivity_timeout();
        timers.arm(
            TimerKind::Inactivity,
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep_until(inner.activity.last() + timeout).await;
                    if inner.activity.elapsed() >= timeout {
                        let aborting = inner.clone();
                        tokio::spawn(async move {
                            aborting.force_abort("inactivity timeout").await;
                        });
                        break;
                    }
                }
            }),
        );
    }

    fn start_polling(self: &Arc<Self>) {
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            let mut stopped = inner.stopped_tx.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(inner.config.poll_interval()) => {}
                    _ = stopped_signal(&mut stopped) => break,
                }

                let current = inner.machine.lock().state();
                if current.is_terminal() {
                    break;
                }
                // A hang-up in progress owns the outcome of the call.
                if inner.hangup.attempted() {
                    continue;
                }

                let signals = match inner.sampler.sample().await {
                    Ok(signals) => signals,
                    Err(e) => {
                        debug!(call_id = %inner.call_id, "Sample failed: {}", e);
                        continue;
                    }
                };

                if let Some((next, reason)) =
                    classify(current, &signals, inner.config.detect_ringing)
                {
                    inner.apply(next, reason);
                    if next.is_terminal() {
                        inner.stop();
                        break;
                    }
                }
            }
        });
        self.timers.lock().arm(TimerKind::Poll, handle);
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled = self.timers.lock().cancel_all();
        self.stopped_tx.send_replace(true);
        info!(
            call_id = %self.call_id,
            state = %self.machine.lock().state(),
            cancelled_timers = cancelled,
            "Call monitor stopped"
        );
    }

    async fn force_abort(self: &Arc<Self>, reason: &str) -> CallState {
        let current = self.machine.lock().state();
        if current.is_terminal() {
            self.stop();
            return current;
        }

        warn!(call_id = %self.call_id, "Force-aborting call: {}", reason);
        let outcome = self.hangup.hang_up().await;
        debug!(call_id = %self.call_id, "Hang-up outcome: {:?}", outcome);
        self.apply(CallState::Failed, reason);
        self.stop();
        self.machine.lock().state()
    }

    async fn end_call(self: &Arc<Self>, reason: &str) -> CallState {
        let current = self.machine.lock().state();
        if current.is_terminal() {
            self.stop();
            return current;
        }

        info!(call_id = %self.call_id, "Ending call: {}", reason);
        let outcome = self.hangup.hang_up().await;
        debug!(call_id = %self.call_id, "Hang-up outcome: {:?}", outcome);
        if self.apply(CallState::Ended, reason).is_none()
            && !self.machine.lock().state().is_terminal()
        {
            // Not a live conversation yet; ending early is a failure.
            self.apply(CallState::Failed, reason);
        }
        self.stop();
        self.machine.lock().state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::signals::fake::ScriptedSampler;
    use crate::detector::state::SETTLE_FAILURE_REASON;
    use crate::driver::fake::FakePage;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn monitor_for(page: Arc<FakePage>, config: DetectorConfig) -> CallMonitor {
        CallMonitor::for_page("call-test", config, page, ActivityClock::new())
    }

    fn targets(monitor: &CallMonitor) -> Vec<CallState> {
        monitor.history().iter().map(|t| t.to).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_control_fails_after_settle_without_hangup() {
        let page = Arc::new(FakePage::new());
        let monitor = monitor_for(page.clone(), DetectorConfig::default());

        let started = tokio::time::Instant::now();
        let state = monitor.start().await.unwrap();
        assert_eq!(state, CallState::Failed);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));

        let history = monitor.history();
        assert_eq!(targets(&monitor), vec![CallState::Dialing, CallState::Failed]);
        assert_eq!(history[1].reason, SETTLE_FAILURE_REASON);
        assert!(monitor.is_stopped());
        assert!(page.actions().is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(monitor.history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_then_control_disappears() {
        let page = Arc::new(FakePage::new());
        page.show("End call");
        let monitor = monitor_for(page.clone(), DetectorConfig::default());
        let mut transitions = monitor.subscribe();

        assert_eq!(monitor.start().await.unwrap(), CallState::Connected);
        page.hide_all();
        assert_eq!(monitor.finished().await, CallState::Ended);
        assert_eq!(
            targets(&monitor),
            vec![CallState::Dialing, CallState::Connected, CallState::Ended]
        );

        let mut received = Vec::new();
        while let Ok(t) = transitions.try_recv() {
            received.push(t.to);
        }
        assert_eq!(received, targets(&monitor));
        // The call ended on its own; no hang-up was attempted.
        assert_eq!(page.count_actions("click"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_failures_are_isolated() {
        let page = Arc::new(FakePage::new());
        page.show("End call");
        let monitor = monitor_for(page.clone(), DetectorConfig::default());

        let seen = Arc::new(AtomicUsize::new(0));
        monitor.on_state_change(|_| Err(anyhow::anyhow!("observer broke")));
        monitor.on_state_change(|_| panic!("observer panicked"));
        let counter = seen.clone();
        monitor.on_state_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        monitor.start().await.unwrap();
        page.hide_all();
        monitor.finished().await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ringing_timeout_force_aborts() {
        let page = Arc::new(FakePage::new());
        page.show(".ringing");
        let config = DetectorConfig {
            detect_ringing: true,
            signals: crate::config::SignalConfig {
                ringing_selectors: vec![".ringing".to_string()],
                ..Default::default()
            },
            ..DetectorConfig::default()
        };
        let monitor = monitor_for(page.clone(), config);

        assert_eq!(monitor.start().await.unwrap(), CallState::Ringing);
        assert_eq!(monitor.finished().await, CallState::Failed);
        let last = monitor.history().last().cloned().unwrap();
        assert_eq!(last.from, CallState::Ringing);
        assert_eq!(last.reason, "ringing timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ringing_then_connected() {
        let page = Arc::new(FakePage::new());
        page.show(".ringing");
        let config = DetectorConfig {
            detect_ringing: true,
            signals: crate::config::SignalConfig {
                ringing_selectors: vec![".ringing".to_string()],
                ..Default::default()
            },
            ..DetectorConfig::default()
        };
        let monitor = monitor_for(page.clone(), config);

        monitor.start().await.unwrap();
        page.show("End call");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(monitor.state(), CallState::Connected);

        // The ringing watchdog was cleared by the connection.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(monitor.state(), CallState::Connected);
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_watchdog() {
        let page = Arc::new(FakePage::new());
        page.show("End call");
        let config = DetectorConfig {
            inactivity_timeout_ms: 10_000,
            ..DetectorConfig::default()
        };
        let monitor = monitor_for(page.clone(), config);
        monitor.start().await.unwrap();

        let clock = monitor.activity();
        let toucher = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;
                clock.touch();
            }
        });
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(monitor.state(), CallState::Connected);

        toucher.abort();
        assert_eq!(monitor.finished().await, CallState::Failed);
        let last = monitor.history().last().cloned().unwrap();
        assert_eq!(last.reason, "inactivity timeout");
        // The line was released through the escalation.
        assert_eq!(page.count_actions("click_text:End call"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_watchdog() {
        let page = Arc::new(FakePage::new());
        page.show("End call");
        let config = DetectorConfig {
            max_call_duration_ms: 20_000,
            ..DetectorConfig::default()
        };
        let monitor = monitor_for(page.clone(), config);
        monitor.start().await.unwrap();

        assert_eq!(monitor.finished().await, CallState::Failed);
        assert_eq!(
            monitor.history().last().unwrap().reason,
            "max call duration exceeded"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_voicemail_hangs_up_and_ends() {
        let page = Arc::new(FakePage::new());
        page.show("End call");
        let config = DetectorConfig {
            signals: crate::config::SignalConfig {
                voicemail_labels: vec!["leave a message".to_string()],
                ..Default::default()
            },
            ..DetectorConfig::default()
        };
        let monitor = monitor_for(page.clone(), config);
        monitor.start().await.unwrap();

        page.show("leave a message");
        assert_eq!(monitor.finished().await, CallState::Ended);
        assert_eq!(
            targets(&monitor),
            vec![
                CallState::Dialing,
                CallState::Connected,
                CallState::Voicemail,
                CallState::Ended
            ]
        );
        assert_eq!(monitor.history().last().unwrap().reason, "voicemail timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_abort_and_end_hang_up_once() {
        let page = Arc::new(FakePage::new());
        page.show("End call");
        let monitor = monitor_for(page.clone(), DetectorConfig::default());
        monitor.start().await.unwrap();

        let (a, b) = tokio::join!(
            monitor.force_abort("watchdog"),
            monitor.end_call("conversation over")
        );
        assert_eq!(a, b);
        assert!(a.is_terminal());
        assert_eq!(page.count_actions("click_text:End call"), 1);
        let terminal = monitor
            .history()
            .iter()
            .filter(|t| t.to.is_terminal())
            .count();
        assert_eq!(terminal, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_safe_before_start() {
        let page = Arc::new(FakePage::new());
        let monitor = monitor_for(page, DetectorConfig::default());
        monitor.stop();
        monitor.stop();
        assert_eq!(monitor.start().await.unwrap(), CallState::Idle);
        assert!(monitor.history().is_empty());
    }

    #[tokio::test]
    async fn test_finished_resolves_when_stopped_without_waiters() {
        let page = Arc::new(FakePage::new());
        let monitor = monitor_for(page, DetectorConfig::default());
        monitor.stop();

        let finished = tokio::time::timeout(Duration::from_secs(2), monitor.finished()).await;
        assert_eq!(finished.unwrap(), CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_errors_do_not_break_polling() {
        let page = Arc::new(FakePage::new());
        let sampler = Arc::new(ScriptedSampler::new(CallSignals {
            hangup_visible: true,
            ..Default::default()
        }));
        let monitor = CallMonitor::new(
            "call-test",
            DetectorConfig::default(),
            page,
            sampler.clone(),
            ActivityClock::new(),
        );
        monitor.start().await.unwrap();

        sampler.set_failing(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(monitor.state(), CallState::Connected);

        sampler.set_failing(false);
        sampler.set(CallSignals::default());
        assert_eq!(monitor.finished().await, CallState::Ended);
        assert!(sampler.samples() > 5);
    }
}
