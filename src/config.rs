//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with VOICE_DIALER prefix, `__` between path segments)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (HOST, PORT, ELEVENLABS_API_KEY, ELEVENLABS_AGENT_ID)
//! 2. Prefixed environment variables (VOICE_DIALER__DETECTOR__SETTLE_MS, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)
//!
//! ## Sections:
//! - **server**: where the local relay/diagnostics HTTP server listens
//! - **session**: the external conversational voice service
//! - **detector**: call-state sampling, watchdogs and page heuristics
//! - **stream**: capture gates, playback and audio format
//! - **storage**: where recordings, transcripts and diagnostics land
//! - **performance**: concurrency limits

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub detector: DetectorConfig,
    pub stream: StreamConfig,
    pub storage: StorageConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// The in-page capture script connects back to this server, so in practice
/// `host` stays on a loopback address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// WebSocket URL the browser page uses to reach the capture relay.
    pub fn relay_url(&self) -> String {
        format!("ws://{}:{}/ws/capture", self.host, self.port)
    }
}

/// External conversational voice service settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint of the conversation API (the agent id is appended as a query)
/// - `api_key`: credential sent with the handshake, never serialized
/// - `keepalive_interval_ms`: how often a WebSocket ping is sent
/// - `max_reconnect_attempts` / `reconnect_delay_ms`: bounded reconnect after a mid-session drop
/// - `ready_settle_ms`: delay between sending call context and opening the audio gate
/// - `ready_timeout_ms`: how long to wait for initiation metadata before treating the link as dropped
/// - `max_pending_chunks`: cap on audio buffered before the session is ready
/// - `closing_phrases`: agent phrases that flag the conversation as ending
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub url: String,
    pub agent_id: String,
    #[serde(skip_serializing, default)]
    pub api_key: String,
    pub keepalive_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub ready_settle_ms: u64,
    pub ready_timeout_ms: u64,
    pub max_pending_chunks: usize,
    pub closing_phrases: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.elevenlabs.io/v1/convai/conversation".to_string(),
            agent_id: String::new(),
            api_key: String::new(),
            keepalive_interval_ms: 10_000,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 2_000,
            ready_settle_ms: 200,
            ready_timeout_ms: 10_000,
            max_pending_chunks: 500,
            closing_phrases: [
                "goodbye",
                "good bye",
                "bye for now",
                "have a great day",
                "have a nice day",
                "take care",
                "talk to you soon",
                "thanks for your time",
                "thank you for your time",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("url", &self.url)
            .field("agent_id", &self.agent_id)
            .field("api_key", &"[REDACTED]")
            .field("keepalive_interval_ms", &self.keepalive_interval_ms)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("ready_settle_ms", &self.ready_settle_ms)
            .field("ready_timeout_ms", &self.ready_timeout_ms)
            .field("max_pending_chunks", &self.max_pending_chunks)
            .field("closing_phrases", &self.closing_phrases)
            .finish()
    }
}

impl SessionConfig {
    /// Full connection URL including the agent id query parameter.
    pub fn endpoint(&self) -> String {
        if self.agent_id.is_empty() {
            self.url.clone()
        } else if self.url.contains('?') {
            format!("{}&agent_id={}", self.url, self.agent_id)
        } else {
            format!("{}?agent_id={}", self.url, self.agent_id)
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn ready_settle(&self) -> Duration {
        Duration::from_millis(self.ready_settle_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Call-state detection settings.
///
/// ## Timers:
/// - `settle_ms`: wait after dialing before the single definitive connection check
/// - `poll_interval_ms`: sampling period while a call is live
/// - `dialing_timeout_ms`, `ringing_timeout_ms`: give up on unanswered calls
/// - `inactivity_timeout_ms`: force-abort when nothing happens (frozen UI)
/// - `max_call_duration_ms`: hard safety ceiling for any call
/// - `voicemail_timeout_ms`: how long to stay on a voicemail greeting
/// - `hangup_verify_ms`: pause before checking that a hang-up strategy worked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub settle_ms: u64,
    pub poll_interval_ms: u64,
    pub dialing_timeout_ms: u64,
    pub ringing_timeout_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub max_call_duration_ms: u64,
    pub voicemail_timeout_ms: u64,
    pub hangup_verify_ms: u64,
    /// Enter RINGING when the page shows a ringing indicator after the settle window.
    pub detect_ringing: bool,
    pub signals: SignalConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            settle_ms: 3_000,
            poll_interval_ms: 500,
            dialing_timeout_ms: 45_000,
            ringing_timeout_ms: 30_000,
            inactivity_timeout_ms: 120_000,
            max_call_duration_ms: 600_000,
            voicemail_timeout_ms: 15_000,
            hangup_verify_ms: 500,
            detect_ringing: false,
            signals: SignalConfig::default(),
        }
    }
}

impl DetectorConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dialing_timeout(&self) -> Duration {
        Duration::from_millis(self.dialing_timeout_ms)
    }

    pub fn ringing_timeout(&self) -> Duration {
        Duration::from_millis(self.ringing_timeout_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn max_call_duration(&self) -> Duration {
        Duration::from_millis(self.max_call_duration_ms)
    }

    pub fn voicemail_timeout(&self) -> Duration {
        Duration::from_millis(self.voicemail_timeout_ms)
    }

    pub fn hangup_verify(&self) -> Duration {
        Duration::from_millis(self.hangup_verify_ms)
    }
}

/// Page heuristics used to read call state and to hang up.
///
/// Telephony UIs change without notice, so every selector and label lives
/// here instead of in code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// CSS selectors that match a visible "end call" control.
    pub hangup_selectors: Vec<String>,
    /// Visible labels of an "end call" control (matched as text).
    pub hangup_labels: Vec<String>,
    pub ringing_selectors: Vec<String>,
    pub voicemail_selectors: Vec<String>,
    pub voicemail_labels: Vec<String>,
    /// Key pressed by the second hang-up strategy.
    pub cancel_key: String,
    /// Point clicked by the third hang-up strategy (outside the call surface).
    pub outside_click_x: i32,
    pub outside_click_y: i32,
}

impl Default for SignalConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            hangup_selectors: strings(&[
                "button[aria-label*='End call' i]",
                "button[aria-label*='Hang up' i]",
                "[data-tooltip*='End call' i]",
                "button[title*='Hang up' i]",
            ]),
            hangup_labels: strings(&["End call", "Hang up"]),
            ringing_selectors: Vec::new(),
            voicemail_selectors: Vec::new(),
            voicemail_labels: Vec::new(),
            cancel_key: "Escape".to_string(),
            outside_click_x: 5,
            outside_click_y: 5,
        }
    }
}

/// Audio streaming settings.
///
/// ## Gates:
/// - `min_chunk_bytes`: captured frames smaller than this are dropped
/// - `playback_gate_ms`: captured frames arriving this soon after agent playback are dropped
///
/// ## Playback:
/// - `playback_command`: external player fed raw PCM on stdin; empty means no device playback
/// - `relay_playback`: also push agent audio to the page over the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub min_chunk_bytes: usize,
    pub playback_gate_ms: u64,
    pub max_consecutive_errors: u32,
    pub ending_grace_ms: u64,
    pub capture_queue_capacity: usize,
    pub playback_command: Vec<String>,
    pub relay_playback: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bit_depth: 16,
            min_chunk_bytes: 320,
            playback_gate_ms: 200,
            max_consecutive_errors: 10,
            ending_grace_ms: 8_000,
            capture_queue_capacity: 256,
            playback_command: Vec::new(),
            relay_playback: false,
        }
    }
}

impl StreamConfig {
    pub fn playback_gate(&self) -> Duration {
        Duration::from_millis(self.playback_gate_ms)
    }

    pub fn ending_grace(&self) -> Duration {
        Duration::from_millis(self.ending_grace_ms)
    }
}

/// Output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub recordings_dir: PathBuf,
    pub transcripts_dir: PathBuf,
    pub diagnostics_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("data/recordings"),
            transcripts_dir: PathBuf::from("data/transcripts"),
            diagnostics_dir: PathBuf::from("data/diagnostics"),
        }
    }
}

/// Performance tuning configuration.
///
/// The campaign loop dials sequentially, so one concurrent call is the norm;
/// the limit exists to catch a loop that forgot to tear down its last call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_calls: usize,
    /// Finished calls older than this are dropped from the registry.
    pub call_retention_secs: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            call_retention_secs: 3_600,
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `VOICE_DIALER__SERVER__PORT=3000`: Override server port
    /// - `VOICE_DIALER__DETECTOR__SETTLE_MS=5000`: Longer settle window
    /// - `ELEVENLABS_API_KEY=...`: Session credential
    /// - `HOST=0.0.0.0`, `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("VOICE_DIALER")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("ELEVENLABS_API_KEY") {
            settings = settings.set_override("session.api_key", key)?;
        }

        if let Ok(agent) = env::var("ELEVENLABS_AGENT_ID") {
            settings = settings.set_override("session.agent_id", agent)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Sampling/poll intervals are non-zero and the settle window fits inside the dialing timeout
    /// - Audio format is something the transcoder can write (16-bit PCM)
    /// - At least one hang-up heuristic exists, otherwise no call could ever be CONNECTED
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.detector.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Detector poll interval must be greater than 0"));
        }

        if self.detector.settle_ms >= self.detector.dialing_timeout_ms {
            return Err(anyhow::anyhow!(
                "Settle window ({}ms) must be shorter than the dialing timeout ({}ms)",
                self.detector.settle_ms,
                self.detector.dialing_timeout_ms
            ));
        }

        if self.detector.max_call_duration_ms == 0 {
            return Err(anyhow::anyhow!("Max call duration must be greater than 0"));
        }

        if self.detector.signals.hangup_selectors.is_empty()
            && self.detector.signals.hangup_labels.is_empty()
        {
            return Err(anyhow::anyhow!(
                "At least one hang-up selector or label must be configured"
            ));
        }

        if self.stream.sample_rate == 0 || self.stream.channels == 0 {
            return Err(anyhow::anyhow!("Sample rate and channel count must be greater than 0"));
        }

        if self.stream.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM is supported, got {} bits",
                self.stream.bit_depth
            ));
        }

        if self.stream.max_consecutive_errors == 0 {
            return Err(anyhow::anyhow!("Max consecutive errors must be greater than 0"));
        }

        if self.stream.capture_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Capture queue capacity must be greater than 0"));
        }

        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the tunables that are safe to change between calls are accepted;
    /// the server address and credentials are fixed at startup.
    /// For example, `{"detector": {"settle_ms": 5000}}` changes only the settle window.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(detector) = partial_config.get("detector") {
            let fields: [(&str, &mut u64); 8] = [
                ("settle_ms", &mut self.detector.settle_ms),
                ("poll_interval_ms", &mut self.detector.poll_interval_ms),
                ("dialing_timeout_ms", &mut self.detector.dialing_timeout_ms),
                ("ringing_timeout_ms", &mut self.detector.ringing_timeout_ms),
                ("inactivity_timeout_ms", &mut self.detector.inactivity_timeout_ms),
                ("max_call_duration_ms", &mut self.detector.max_call_duration_ms),
                ("voicemail_timeout_ms", &mut self.detector.voicemail_timeout_ms),
                ("hangup_verify_ms", &mut self.detector.hangup_verify_ms),
            ];
            for (name, slot) in fields {
                if let Some(value) = detector.get(name).and_then(|v| v.as_u64()) {
                    *slot = value;
                }
            }
            if let Some(flag) = detector.get("detect_ringing").and_then(|v| v.as_bool()) {
                self.detector.detect_ringing = flag;
            }
            if let Some(signals) = detector.get("signals") {
                self.detector.signals = serde_json::from_value(signals.clone())?;
            }
        }

        if let Some(stream) = partial_config.get("stream") {
            if let Some(value) = stream.get("min_chunk_bytes").and_then(|v| v.as_u64()) {
                self.stream.min_chunk_bytes = value as usize;
            }
            if let Some(value) = stream.get("playback_gate_ms").and_then(|v| v.as_u64()) {
                self.stream.playback_gate_ms = value;
            }
            if let Some(value) = stream.get("max_consecutive_errors").and_then(|v| v.as_u64()) {
                self.stream.max_consecutive_errors = value as u32;
            }
            if let Some(value) = stream.get("ending_grace_ms").and_then(|v| v.as_u64()) {
                self.stream.ending_grace_ms = value;
            }
        }

        if let Some(session) = partial_config.get("session") {
            if let Some(agent) = session.get("agent_id").and_then(|v| v.as_str()) {
                self.session.agent_id = agent.to_string();
            }
            if let Some(phrases) = session.get("closing_phrases") {
                self.session.closing_phrases = serde_json::from_value(phrases.clone())?;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.detector.settle_ms, 3_000);
        assert_eq!(config.stream.playback_gate_ms, 200);
        assert_eq!(config.session.max_reconnect_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.detector.settle_ms = config.detector.dialing_timeout_ms;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.detector.signals.hangup_selectors.clear();
        config.detector.signals.hangup_labels.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.stream.bit_depth = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"detector": {"settle_ms": 5000}, "stream": {"playback_gate_ms": 350}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.detector.settle_ms, 5000);
        assert_eq!(config.stream.playback_gate_ms, 350);
        assert_eq!(config.detector.poll_interval_ms, 500);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_config_update_rejects_invalid_result() {
        let mut config = AppConfig::default();
        let json = r#"{"detector": {"poll_interval_ms": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }

    #[test]
    fn test_endpoint_and_relay_url() {
        let mut session = SessionConfig::default();
        session.agent_id = "agent_123".to_string();
        assert_eq!(
            session.endpoint(),
            "wss://api.elevenlabs.io/v1/convai/conversation?agent_id=agent_123"
        );
        assert_eq!(
            ServerConfig::default().relay_url(),
            "ws://127.0.0.1:8080/ws/capture"
        );
    }

    #[test]
    fn test_api_key_redacted() {
        let mut session = SessionConfig::default();
        session.api_key = "secret-key".to_string();
        let debug = format!("{:?}", session);
        assert!(!debug.contains("secret-key"));
        let json = serde_json::to_string(&session).unwrap();
        assert!(!json.contains("secret-key"));
    }
}
