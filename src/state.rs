//! # Application State Management
//!
//! Shared state handed to every HTTP handler and relay connection.
//!
//! ## Pieces:
//! - **config**: runtime-updatable configuration behind a read/write lock
//! - **metrics**: request and relay counters, updated on every request/frame
//! - **hub**: routes page audio to the call that owns it
//! - **calls**: registry of live and recently finished calls
//!
//! Every field is cheap to clone (`Arc` inside), so `AppState` itself is
//! cloned into each actix worker.

use crate::call::registry::CallRegistry;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::relay::hub::RelayHub;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters updated by the metrics middleware and the relay
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub hub: RelayHub,

    pub calls: CallRegistry,

    /// When the server started (never changes)
    pub start_time: Instant,
}

/// Counters collected since server start.
///
/// ## What they tell you:
/// - **request_count / error_count**: HTTP load and reliability
/// - **active_relays**: page connections currently streaming audio
/// - **frames_relayed / bytes_relayed**: capture throughput
/// - **capture_errors**: pages that could not start capturing
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_relays: u32,
    pub frames_relayed: u64,
    pub bytes_relayed: u64,
    pub capture_errors: u64,
    /// Key: route pattern (e.g. "GET /api/v1/calls/{call_id}")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint request statistics.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let calls = CallRegistry::new(config.performance.max_concurrent_calls);
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            hub: RelayHub::new(),
            calls,
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration. The lock is released right away.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> AppResult<()> {
        new_config
            .validate()
            .map_err(|e| AppError::ValidationError(e.to_string()))?;
        *self.config.write() = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn relay_connected(&self) {
        self.metrics.write().active_relays += 1;
    }

    /// Never goes below zero.
    pub fn relay_disconnected(&self) {
        let mut metrics = self.metrics.write();
        metrics.active_relays = metrics.active_relays.saturating_sub(1);
    }

    pub fn record_relayed_frame(&self, bytes: usize) {
        let mut metrics = self.metrics.write();
        metrics.frames_relayed += 1;
        metrics.bytes_relayed += bytes as u64;
    }

    pub fn record_capture_error(&self) {
        self.metrics.write().capture_errors += 1;
    }

    /// Consistent copy of all counters, taken under one read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
