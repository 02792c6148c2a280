//! # Hang-up Escalation
//!
//! Telephony UIs move their "end call" control around, so hanging up is an
//! escalation of strategies, each verified by re-sampling the page:
//!
//! 1. click a control matched by the configured selectors, then labels
//! 2. press the cancel key (Escape)
//! 3. click outside the call surface
//! 4. reload the page
//!
//! The escalation runs at most once per call. Concurrent callers (a watchdog
//! and the normal end-of-call path) wait for and share the same outcome.

use crate::config::SignalConfig;
use crate::detector::signals::SignalSampler;
use crate::driver::PageDriver;
use crate::error::AppResult;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupStrategy {
    ClickControl,
    CancelKey,
    ClickOutside,
    Reload,
}

impl HangupStrategy {
    pub const ESCALATION: [HangupStrategy; 4] = [
        HangupStrategy::ClickControl,
        HangupStrategy::CancelKey,
        HangupStrategy::ClickOutside,
        HangupStrategy::Reload,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "strategy")]
pub enum HangupOutcome {
    /// No call control was on screen to begin with.
    AlreadyClear,
    /// The control disappeared after this strategy.
    Cleared(HangupStrategy),
    /// Every strategy ran and the control is still visible.
    Unresolved,
}

pub struct HangupController {
    driver: Arc<dyn PageDriver>,
    sampler: Arc<dyn SignalSampler>,
    signals: SignalConfig,
    verify_delay: Duration,
    started: AtomicBool,
    outcome: OnceCell<HangupOutcome>,
}

impl HangupController {
    pub fn new(
        driver: Arc<dyn PageDriver>,
        sampler: Arc<dyn SignalSampler>,
        signals: SignalConfig,
        verify_delay: Duration,
    ) -> Self {
        Self {
            driver,
            sampler,
            signals,
            verify_delay,
            started: AtomicBool::new(false),
            outcome: OnceCell::new(),
        }
    }

    /// Hang up the call. Only the first caller runs the escalation.
    pub async fn hang_up(&self) -> HangupOutcome {
        self.started.store(true, Ordering::SeqCst);
        *self.outcome.get_or_init(|| self.escalate()).await
    }

    /// Whether a hang-up has already been attempted (or is running).
    pub fn attempted(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn outcome(&self) -> Option<HangupOutcome> {
        self.outcome.get().copied()
    }

    async fn control_visible(&self) -> bool {
        match self.sampler.sample().await {
            Ok(signals) => signals.hangup_visible,
            Err(e) => {
                // Can't tell; assume the line may still be open.
                debug!("Hang-up verification sample failed: {}", e);
                true
            }
        }
    }

    async fn escalate(&self) -> HangupOutcome {
        if !self.control_visible().await {
            info!("No call control visible, nothing to hang up");
            return HangupOutcome::AlreadyClear;
        }

        for strategy in HangupStrategy::ESCALATION {
            match self.apply(strategy).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Hang-up strategy {:?} had nothing to act on", strategy);
                    continue;
                }
                Err(e) => {
                    warn!("Hang-up strategy {:?} failed: {}", strategy, e);
                    continue;
                }
            }

            tokio::time::sleep(self.verify_delay).await;
            if !self.control_visible().await {
                info!("Call hung up via {:?}", strategy);
                return HangupOutcome::Cleared(strategy);
            }
            debug!("Call control still visible after {:?}", strategy);
        }

        warn!("Call control still visible after every hang-up strategy");
        HangupOutcome::Unresolved
    }

    /// Apply one strategy. `Ok(false)` means there was nothing to act on.
    async fn apply(&self, strategy: HangupStrategy) -> AppResult<bool> {
        match strategy {
            HangupStrategy::ClickControl => {
                for selector in &self.signals.hangup_selectors {
                    if self.driver.click(selector).await? {
                        return Ok(true);
                    }
                }
                for label in &self.signals.hangup_labels {
                    if self.driver.click_text(label).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            HangupStrategy::CancelKey => {
                self.driver.press_key(&self.signals.cancel_key).await?;
                Ok(true)
            }
            HangupStrategy::ClickOutside => {
                self.driver
                    .click_at(self.signals.outside_click_x, self.signals.outside_click_y)
                    .await?;
                Ok(true)
            }
            HangupStrategy::Reload => {
                self.driver.reload().await?;
                Ok(true)
            }
        }
    }
}
