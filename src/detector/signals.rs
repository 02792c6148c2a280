//! # Call Signals
//!
//! The monitor never inspects the page itself. A [`SignalSampler`] reduces
//! whatever the telephony UI shows to a small [`CallSignals`] value, and the
//! state machine works only with that.

use crate::config::SignalConfig;
use crate::driver::PageDriver;
use crate::error::AppResult;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// What the page shows at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallSignals {
    /// An "end call" control is on screen. This is the connected signal.
    pub hangup_visible: bool,
    pub ringing: bool,
    pub voicemail: bool,
}

#[async_trait]
pub trait SignalSampler: Send + Sync {
    async fn sample(&self) -> AppResult<CallSignals>;
}

/// Samples the page through the driver using configured selectors and labels.
pub struct DomSignalSampler {
    driver: Arc<dyn PageDriver>,
    signals: SignalConfig,
}

impl DomSignalSampler {
    pub fn new(driver: Arc<dyn PageDriver>, signals: SignalConfig) -> Self {
        Self { driver, signals }
    }

    async fn any_visible(&self, selectors: &[String], labels: &[String]) -> AppResult<bool> {
        for selector in selectors {
            if self.driver.is_visible(selector).await? {
                return Ok(true);
            }
        }
        for label in labels {
            if self.driver.is_text_visible(label).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl SignalSampler for DomSignalSampler {
    async fn sample(&self) -> AppResult<CallSignals> {
        let hangup_visible = self
            .any_visible(&self.signals.hangup_selectors, &self.signals.hangup_labels)
            .await?;
        let ringing = self.any_visible(&self.signals.ringing_selectors, &[]).await?;
        let voicemail = self
            .any_visible(&self.signals.voicemail_selectors, &self.signals.voicemail_labels)
            .await?;

        Ok(CallSignals {
            hangup_visible,
            ringing,
            voicemail,
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::error::AppError;
    use parking_lot::Mutex;

    /// Sampler whose answer the test sets directly.
    #[derive(Default)]
    pub struct ScriptedSampler {
        current: Mutex<CallSignals>,
        failing: Mutex<bool>,
        samples: Mutex<usize>,
    }

    impl ScriptedSampler {
        pub fn new(initial: CallSignals) -> Self {
            Self {
                current: Mutex::new(initial),
                ..Self::default()
            }
        }

        pub fn set(&self, signals: CallSignals) {
            *self.current.lock() = signals;
        }

        pub fn set_failing(&self, failing: bool) {
            *self.failing.lock() = failing;
        }

        pub fn samples(&self) -> usize {
            *self.samples.lock()
        }
    }

    #[async_trait]
    impl SignalSampler for ScriptedSampler {
        async fn sample(&self) -> AppResult<CallSignals> {
            *self.samples.lock() += 1;
            if *self.failing.lock() {
                return Err(AppError::Driver("sample failed".to_string()));
            }
            Ok(*self.current.lock())
        }
    }
}
