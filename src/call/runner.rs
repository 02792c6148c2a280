//! # Call Runner
//!
//! Drives one outbound call attempt end to end:
//!
//! 1. Register the call and dial through the page driver
//! 2. Start the monitor and wait for `Connected` (or a terminal state)
//! 3. Open the conversation, bind the relay and start the stream handler;
//!    a conversation that cannot connect force-aborts the call
//! 4. Wait for the monitor to finish, or for the stream handler to stop on
//!    its own, which ends the call
//! 5. Tear down, finalize the recording, persist recording and transcript
//!
//! The monitor and stream handler live exactly as long as the attempt.

use crate::audio::playback::{build_sink, AudioSink};
use crate::audio::transcoder::RecordingFile;
use crate::call::registry::CallRegistry;
use crate::call::storage::{CallStore, JsonFileStore};
use crate::config::{AppConfig, SessionConfig};
use crate::detector::state::{CallState, StateTransition};
use crate::detector::watchdog::ActivityClock;
use crate::detector::CallMonitor;
use crate::driver::PageDriver;
use crate::error::{AppError, AppResult};
use crate::relay::hub::RelayHub;
use crate::session::{ConversationLink, SessionClient, SessionEvent};
use crate::state::AppState;
use crate::stream::handler::{AudioStreamHandler, PageAttachment, StopReason};
use crate::stream::transcript::ConversationTurn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, info_span, warn, Instrument};

/// The person being called.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub phone_number: String,
    /// Extra per-call context handed to the agent.
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl Contact {
    pub fn validate(&self) -> AppResult<()> {
        let number = self.phone_number.trim();
        if number.is_empty() {
            return Err(AppError::ValidationError(
                "Phone number must not be empty".to_string(),
            ));
        }
        if !number
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')' | '.'))
        {
            return Err(AppError::ValidationError(format!(
                "Phone number contains invalid characters: {}",
                number
            )));
        }
        if !number.chars().any(|c| c.is_ascii_digit()) {
            return Err(AppError::ValidationError(
                "Phone number has no digits".to_string(),
            ));
        }
        Ok(())
    }

    /// Conversation context: the contact's own variables plus its identity.
    pub fn dynamic_variables(&self) -> HashMap<String, String> {
        let mut variables = self.variables.clone();
        variables
            .entry("contact_id".to_string())
            .or_insert_with(|| self.id.clone());
        variables
            .entry("contact_name".to_string())
            .or_insert_with(|| self.name.clone());
        variables
            .entry("phone_number".to_string())
            .or_insert_with(|| self.phone_number.clone());
        variables
    }
}

/// Outcome of one call attempt.
#[derive(Debug, Clone, Serialize)]
pub struct CallReport {
    pub call_id: String,
    pub contact_id: String,
    pub final_state: CallState,
    pub transitions: Vec<StateTransition>,
    pub recording_path: Option<PathBuf>,
    pub recording_duration_seconds: Option<f64>,
    pub turns: Vec<ConversationTurn>,
    pub diagnostics_path: Option<PathBuf>,
}

/// An opened (not yet connected) conversation.
pub struct Conversation {
    pub link: Arc<dyn ConversationLink>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Creates the conversation for a connected call.
pub trait ConversationFactory: Send + Sync {
    fn open(&self, call_id: &str, contact: &Contact) -> AppResult<Conversation>;
}

/// Conversations against the configured voice service.
pub struct ServiceConversations {
    config: SessionConfig,
}

impl ServiceConversations {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

impl ConversationFactory for ServiceConversations {
    fn open(&self, _call_id: &str, contact: &Contact) -> AppResult<Conversation> {
        if self.config.api_key.is_empty() {
            return Err(AppError::ConfigError(
                "Voice service API key is not configured".to_string(),
            ));
        }
        let (client, events) = SessionClient::new(
            self.config.clone(),
            self.config.api_key.clone(),
            contact.dynamic_variables(),
        );
        Ok(Conversation {
            link: Arc::new(client),
            events,
        })
    }
}

pub struct CallRunner {
    config: AppConfig,
    driver: Arc<dyn PageDriver>,
    store: Arc<dyn CallStore>,
    registry: CallRegistry,
    hub: RelayHub,
    conversations: Arc<dyn ConversationFactory>,
    sink: Option<Arc<dyn AudioSink>>,
}

impl CallRunner {
    pub fn new(
        config: AppConfig,
        driver: Arc<dyn PageDriver>,
        store: Arc<dyn CallStore>,
        registry: CallRegistry,
        hub: RelayHub,
    ) -> Self {
        let conversations = Arc::new(ServiceConversations::new(config.session.clone()));
        Self {
            config,
            driver,
            store,
            registry,
            hub,
            conversations,
            sink: None,
        }
    }

    /// Runner sharing the server's registry and relay, persisting records as
    /// JSON under `storage.transcripts_dir`.
    ///
    /// Calls placed through it show up in `/api/v1/calls` and their pages can
    /// reach `/ws/capture`.
    pub fn for_state(state: &AppState, driver: Arc<dyn PageDriver>) -> Self {
        let config = state.get_config();
        let store = Arc::new(JsonFileStore::new(config.storage.transcripts_dir.clone()));
        Self::new(config, driver, store, state.calls.clone(), state.hub.clone())
    }

    pub fn with_conversations(mut self, conversations: Arc<dyn ConversationFactory>) -> Self {
        self.conversations = conversations;
        self
    }

    /// Use this sink instead of the one built from the stream settings.
    pub fn with_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Place one call and see it through to a terminal state.
    pub async fn run(&self, contact: Contact) -> AppResult<CallReport> {
        contact.validate()?;
        let call_id = self.registry.register(None, &contact)?;
        let span = info_span!("call", call_id = %call_id);
        self.run_registered(call_id, contact).instrument(span).await
    }

    async fn run_registered(&self, call_id: String, contact: Contact) -> AppResult<CallReport> {
        let activity = ActivityClock::new();
        let monitor = CallMonitor::for_page(
            call_id.clone(),
            self.config.detector.clone(),
            self.driver.clone(),
            activity.clone(),
        );
        {
            let registry = self.registry.clone();
            let id = call_id.clone();
            monitor.on_state_change(move |transition| {
                registry.record_transition(&id, transition);
                Ok(())
            });
        }
        let mut transitions = monitor.subscribe();

        info!("Dialing {} ({})", contact.name, contact.phone_number);
        if let Err(e) = self.driver.dial(&contact.phone_number).await {
            error!("Dial failed: {}", e);
            self.registry.complete(&call_id, CallState::Failed, None);
            return Err(e);
        }

        let state = monitor.start().await?;
        let connected = match state {
            CallState::Connected => true,
            s if s.is_terminal() => false,
            _ => wait_for_connected(&monitor, &mut transitions).await,
        };

        let handler = if connected {
            self.start_stream(&call_id, &contact, &monitor, activity).await
        } else {
            None
        };

        match &handler {
            Some(handler) => {
                tokio::select! {
                    _ = monitor.finished() => {}
                    _ = handler.finished() => {
                        if !monitor.state().is_terminal() {
                            let reason = handler.stop_reason().unwrap_or(StopReason::Requested);
                            if reason.is_failure() {
                                warn!("Audio stream failed: {}", reason.as_str());
                                monitor.force_abort(reason.as_str()).await;
                            } else {
                                info!("Audio stream stopped before the call ended");
                                monitor.end_call(reason.as_str()).await;
                            }
                        }
                    }
                }
            }
            None => {
                monitor.finished().await;
            }
        }

        self.finish(call_id, contact, monitor, handler).await
    }

    async fn start_stream(
        &self,
        call_id: &str,
        contact: &Contact,
        monitor: &CallMonitor,
        activity: ActivityClock,
    ) -> Option<AudioStreamHandler> {
        let conversation = match self.conversations.open(call_id, contact) {
            Ok(conversation) => conversation,
            Err(e) => {
                error!("Conversation unavailable: {}", e);
                monitor.force_abort("conversation unavailable").await;
                return None;
            }
        };

        let sink = match &self.sink {
            Some(sink) => sink.clone(),
            None => match build_sink(&self.config.stream, &self.hub, call_id) {
                Ok(sink) => sink,
                Err(e) => {
                    error!("Playback sink unavailable: {}", e);
                    monitor.force_abort("playback unavailable").await;
                    return None;
                }
            },
        };

        let recording_path = self
            .config
            .storage
            .recordings_dir
            .join(format!("{}.wav", call_id));
        let handler = AudioStreamHandler::builder(
            call_id,
            self.config.stream.clone(),
            recording_path,
            conversation.link,
            sink,
            Arc::new(monitor.clone()),
            activity,
        )
        .with_page(PageAttachment {
            driver: self.driver.clone(),
            relay_url: self.config.server.relay_url(),
        })
        .with_relay(self.hub.clone())
        .build();

        if let Err(e) = handler.start(conversation.events).await {
            let reason = match e {
                AppError::Handshake(_) => "conversation handshake failed",
                _ => handler
                    .stop_reason()
                    .map_or("audio streaming failed to start", |r| r.as_str()),
            };
            error!("{}: {}", reason, e);
            monitor.force_abort(reason).await;
        }
        Some(handler)
    }

    async fn finish(
        &self,
        call_id: String,
        contact: Contact,
        monitor: CallMonitor,
        handler: Option<AudioStreamHandler>,
    ) -> AppResult<CallReport> {
        monitor.stop();

        let mut recording: Option<RecordingFile> = None;
        let mut turns = Vec::new();
        if let Some(handler) = &handler {
            match handler.cleanup().await {
                Ok(file) => recording = file,
                Err(e) => error!("Recording could not be finalized: {}", e),
            }
            turns = handler.transcript();
        }

        if let Some(file) = &recording {
            if let Err(e) = self
                .store
                .create_call_recording(&call_id, &file.path, file.duration)
                .await
            {
                error!("Failed to store recording: {}", e);
            }
        }
        if !turns.is_empty() {
            if let Err(e) = self
                .store
                .create_conversation_transcript(&call_id, &turns)
                .await
            {
                error!("Failed to store transcript: {}", e);
            }
        }

        let final_state = monitor.state();
        let diagnostics_path = if final_state == CallState::Failed {
            self.save_diagnostics(&call_id).await
        } else {
            None
        };

        self.registry.complete(
            &call_id,
            final_state,
            recording.as_ref().map(|f| f.path.clone()),
        );
        info!(
            state = %final_state,
            turns = turns.len(),
            recorded = recording.is_some(),
            "Call finished"
        );

        Ok(CallReport {
            call_id,
            contact_id: contact.id,
            final_state,
            transitions: monitor.history(),
            recording_path: recording.as_ref().map(|f| f.path.clone()),
            recording_duration_seconds: recording.as_ref().map(|f| f.duration.as_secs_f64()),
            turns,
            diagnostics_path,
        })
    }

    /// Screenshot of the page at failure time. Best effort.
    async fn save_diagnostics(&self, call_id: &str) -> Option<PathBuf> {
        let png = match self.driver.screenshot().await {
            Ok(png) => png,
            Err(e) => {
                warn!("Diagnostic screenshot failed: {}", e);
                return None;
            }
        };
        let dir = &self.config.storage.diagnostics_dir;
        let path = dir.join(format!("{}.png", call_id));
        let written = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, png).await
        }
        .await;
        match written {
            Ok(()) => {
                info!(path = %path.display(), "Saved diagnostic screenshot");
                Some(path)
            }
            Err(e) => {
                warn!("Could not save diagnostic screenshot: {}", e);
                None
            }
        }
    }
}

/// Wait for `Connected`; false once the call reached a terminal state instead.
async fn wait_for_connected(
    monitor: &CallMonitor,
    transitions: &mut broadcast::Receiver<StateTransition>,
) -> bool {
    loop {
        tokio::select! {
            received = transitions.recv() => match received {
                Ok(t) if t.to == CallState::Connected => return true,
                Ok(t) if t.to.is_terminal() => return false,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if monitor.state() == CallState::Connected {
                        return true;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return false,
            },
            _ = monitor.finished() => return monitor.state() == CallState::Connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::fake::RecordingSink;
    use crate::call::storage::InMemoryStore;
    use crate::driver::fake::FakePage;
    use crate::session::client::fake::FakeLink;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Hands out fake links and keeps the event sender for the test.
    #[derive(Default)]
    struct FakeConversations {
        fail_handshake: bool,
        links: Mutex<Vec<Arc<FakeLink>>>,
        events: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
        variables: Mutex<Option<HashMap<String, String>>>,
    }

    impl ConversationFactory for FakeConversations {
        fn open(&self, _call_id: &str, contact: &Contact) -> AppResult<Conversation> {
            let mut link = FakeLink::new();
            link.fail_handshake = self.fail_handshake;
            let link = Arc::new(link);
            let (tx, rx) = mpsc::unbounded_channel();
            self.links.lock().push(link.clone());
            *self.events.lock() = Some(tx);
            *self.variables.lock() = Some(contact.dynamic_variables());
            Ok(Conversation { link, events: rx })
        }
    }

    struct Harness {
        runner: Arc<CallRunner>,
        page: Arc<FakePage>,
        store: Arc<InMemoryStore>,
        registry: CallRegistry,
        conversations: Arc<FakeConversations>,
        sink: Arc<RecordingSink>,
        _dir: tempfile::TempDir,
    }

    fn harness(conversations: FakeConversations) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.recordings_dir = dir.path().join("recordings");
        config.storage.diagnostics_dir = dir.path().join("diagnostics");

        let page = Arc::new(FakePage::new());
        let store = Arc::new(InMemoryStore::new());
        let registry = CallRegistry::new(2);
        let conversations = Arc::new(conversations);
        let sink = Arc::new(RecordingSink::new());
        let runner = CallRunner::new(
            config,
            page.clone(),
            store.clone(),
            registry.clone(),
            RelayHub::new(),
        )
        .with_conversations(conversations.clone())
        .with_sink(sink.clone());

        Harness {
            runner: Arc::new(runner),
            page,
            store,
            registry,
            conversations,
            sink,
            _dir: dir,
        }
    }

    fn contact() -> Contact {
        Contact {
            id: "contact-7".to_string(),
            name: "Ada".to_string(),
            phone_number: "+1 555 0100".to_string(),
            variables: HashMap::from([("company".to_string(), "Analytical".to_string())]),
        }
    }

    fn targets(report: &CallReport) -> Vec<CallState> {
        report.transitions.iter().map(|t| t.to).collect()
    }

    #[test]
    fn test_contact_validation_and_variables() {
        assert!(contact().validate().is_ok());
        let mut bad = contact();
        bad.phone_number = "call me".to_string();
        assert!(bad.validate().is_err());
        bad.phone_number = "  ".to_string();
        assert!(bad.validate().is_err());

        let variables = contact().dynamic_variables();
        assert_eq!(variables["contact_name"], "Ada");
        assert_eq!(variables["company"], "Analytical");
        assert_eq!(variables["phone_number"], "+1 555 0100");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_fails_without_conversation() {
        let h = harness(FakeConversations::default());

        let report = h.runner.run(contact()).await.unwrap();

        assert_eq!(report.final_state, CallState::Failed);
        assert_eq!(targets(&report), vec![CallState::Dialing, CallState::Failed]);
        assert!(h.conversations.links.lock().is_empty());
        assert!(report.recording_path.is_none());
        assert_eq!(h.page.count_actions("dial:"), 1);
        assert_eq!(h.page.count_actions("screenshot"), 1);
        assert!(h.store.recordings().is_empty());

        let snapshot = h.registry.snapshot(&report.call_id).unwrap();
        assert_eq!(snapshot.state, CallState::Failed);
        assert_eq!(h.registry.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_call_ends_when_control_disappears() {
        let h = harness(FakeConversations::default());
        h.page.show("End call");

        let runner = h.runner.clone();
        let call = tokio::spawn(async move { runner.run(contact()).await });

        // Past the settle window: connected and streaming.
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        let events = h.conversations.events.lock().clone().unwrap();
        for chunk_id in 1..=3u64 {
            events
                .send(SessionEvent::AudioChunk {
                    chunk_id,
                    audio: vec![chunk_id as u8; 32_000],
                    end_ms: None,
                })
                .unwrap();
        }
        events
            .send(SessionEvent::AgentResponse {
                text: "Hi Ada!".to_string(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The other side hangs up while two chunks are still queued.
        h.page.hide_all();
        let report = call.await.unwrap().unwrap();

        assert_eq!(report.final_state, CallState::Ended);
        assert_eq!(
            targets(&report),
            vec![CallState::Dialing, CallState::Connected, CallState::Ended]
        );
        let path = report.recording_path.clone().unwrap();
        assert!(path.exists());
        assert_eq!(h.store.recordings().len(), 1);
        assert_eq!(h.store.transcript(&report.call_id).unwrap().len(), 1);
        assert_eq!(h.page.count_actions("inject:"), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.sink.played().len(), 1);
        assert_eq!(h.conversations.links.lock()[0].disconnects(), 1);

        let variables = h.conversations.variables.lock().clone().unwrap();
        assert_eq!(variables["contact_id"], "contact-7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_failure_force_aborts() {
        let h = harness(FakeConversations {
            fail_handshake: true,
            ..Default::default()
        });
        h.page.show("End call");

        let report = h.runner.run(contact()).await.unwrap();

        assert_eq!(report.final_state, CallState::Failed);
        assert_eq!(
            targets(&report),
            vec![CallState::Dialing, CallState::Connected, CallState::Failed]
        );
        assert_eq!(
            report.transitions.last().unwrap().reason,
            "conversation handshake failed"
        );
        // The line was released through the hang-up control.
        assert!(h.page.count_actions("click") >= 1);
        assert!(report.recording_path.is_none());
        assert!(h.store.recordings().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversation_end_hangs_up() {
        let h = harness(FakeConversations::default());
        h.page.show("End call");

        let runner = h.runner.clone();
        let call = tokio::spawn(async move { runner.run(contact()).await });

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        let events = h.conversations.events.lock().clone().unwrap();
        events
            .send(SessionEvent::AgentResponse {
                text: "Thanks, goodbye!".to_string(),
            })
            .unwrap();
        events
            .send(SessionEvent::ConversationEnding {
                text: "Thanks, goodbye!".to_string(),
            })
            .unwrap();

        let report = call.await.unwrap().unwrap();
        assert_eq!(report.final_state, CallState::Ended);
        assert_eq!(report.transitions.last().unwrap().reason, "conversation ended");
        assert_eq!(h.page.count_actions("click_text:"), 1);
        assert_eq!(h.page.count_actions("key:"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_failure_fails_call() {
        let h = harness(FakeConversations::default());
        h.page.show("End call");

        let runner = h.runner.clone();
        let call = tokio::spawn(async move { runner.run(contact()).await });

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        let events = h.conversations.events.lock().clone().unwrap();
        events
            .send(SessionEvent::Failed {
                reason: "reconnects exhausted".to_string(),
            })
            .unwrap();

        let report = call.await.unwrap().unwrap();
        assert_eq!(report.final_state, CallState::Failed);
        assert_eq!(report.transitions.last().unwrap().reason, "conversation failed");
        assert_eq!(h.page.count_actions("screenshot"), 1);
        assert_eq!(h.registry.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_injection_failure_still_finalizes() {
        let h = harness(FakeConversations::default());
        h.page.show("End call");
        h.page.fail_injection(true);

        let report = h.runner.run(contact()).await.unwrap();

        assert_eq!(report.final_state, CallState::Failed);
        assert_eq!(report.transitions.last().unwrap().reason, "capture unavailable");
        assert!(report.recording_path.is_none());
        assert_eq!(h.conversations.links.lock()[0].disconnects(), 1);
        let snapshot = h.registry.snapshot(&report.call_id).unwrap();
        assert_eq!(snapshot.state, CallState::Failed);
        assert!(snapshot.ended_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_for_server_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.recordings_dir = dir.path().join("recordings");
        config.storage.transcripts_dir = dir.path().join("records");
        config.storage.diagnostics_dir = dir.path().join("diagnostics");
        let state = AppState::new(config);

        let page = Arc::new(FakePage::new());
        page.show("End call");
        let conversations = Arc::new(FakeConversations::default());
        let runner = Arc::new(
            CallRunner::for_state(&state, page.clone())
                .with_conversations(conversations.clone())
                .with_sink(Arc::new(RecordingSink::new())),
        );

        let call = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(contact()).await })
        };
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(state.calls.active_count(), 1);
        let call_id = state.calls.snapshots()[0].call_id.clone();
        assert!(state.hub.is_bound(&call_id));

        let events = conversations.events.lock().clone().unwrap();
        events
            .send(SessionEvent::AgentResponse {
                text: "Hi Ada!".to_string(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        page.hide_all();

        let report = call.await.unwrap().unwrap();
        assert_eq!(report.final_state, CallState::Ended);
        assert!(!state.hub.is_bound(&call_id));
        assert_eq!(state.calls.snapshot(&call_id).unwrap().state, CallState::Ended);

        let store = JsonFileStore::new(dir.path().join("records"));
        assert!(store.transcript_file(&call_id).exists());
        assert!(!store.recording_file(&call_id).exists());
    }

    #[tokio::test]
    async fn test_invalid_contact_is_not_registered() {
        let h = harness(FakeConversations::default());
        let mut bad = contact();
        bad.phone_number = String::new();
        assert!(h.runner.run(bad).await.is_err());
        assert!(h.registry.is_empty());
        assert!(h.page.actions().is_empty());
    }
}
