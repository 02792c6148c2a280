//! # Conversational Session Client
//!
//! Holds the WebSocket connection to the voice service for one call.
//!
//! ## Lifecycle:
//! 1. `connect()` performs the handshake (credential in the `xi-api-key` header)
//!    and spawns the connection task; a failed handshake is returned to the caller
//! 2. On `conversation_initiation_metadata` the per-call context is sent, and
//!    after a short settle delay the readiness gate opens and buffered audio is
//!    flushed in order
//! 3. A drop after a successful handshake triggers a bounded reconnect; each
//!    attempt discards buffered audio
//! 4. `disconnect()` ends the session for good
//!
//! ## Events:
//! Everything the service says is surfaced as a [`SessionEvent`] on the
//! channel returned by [`SessionClient::new`].

use crate::config::SessionConfig;
use crate::error::{AppError, AppResult};
use crate::session::gate::{ReadinessGate, SendDecision, SessionPhase};
use crate::session::protocol::{
    describe_client_data, parse_inbound, ClosingPhrases, InboundMessage, OutboundMessage,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `disconnect()` waits for the connection task to close the socket.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Events surfaced to the consumer of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Ready,
    AudioChunk {
        chunk_id: u64,
        audio: Vec<u8>,
        end_ms: Option<u64>,
    },
    UserTranscript {
        text: String,
        is_final: bool,
        confidence: Option<f32>,
    },
    AgentResponse {
        text: String,
    },
    Interruption,
    ModeChange(String),
    /// The agent used a closing phrase. Emitted at most once per session.
    ConversationEnding {
        text: String,
    },
    Reconnecting {
        attempt: u32,
    },
    Disconnected {
        reason: String,
    },
    /// Reconnects exhausted; the session is over.
    Failed {
        reason: String,
    },
}

/// The conversation as seen by the stream handler.
#[async_trait]
pub trait ConversationLink: Send + Sync {
    /// Open the conversation. Fails when the handshake fails.
    async fn connect(&self) -> AppResult<()>;

    /// Forward one captured frame. Never blocks on the network.
    fn send_audio_chunk(&self, chunk: &[u8]) -> AppResult<()>;

    /// End the conversation. Idempotent.
    async fn disconnect(&self);
}

struct LinkState {
    gate: ReadinessGate,
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

struct Inner {
    config: SessionConfig,
    credential: String,
    dynamic_variables: HashMap<String, String>,
    closing: ClosingPhrases,
    link: Mutex<LinkState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: watch::Sender<bool>,
    chunk_counter: AtomicU64,
    ending_flagged: AtomicBool,
    disconnected: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

enum ConnectionOutcome {
    Shutdown,
    Dropped { reason: String, reached_ready: bool },
}

/// Client for one conversation. Cloning shares the same connection.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<Inner>,
}

impl SessionClient {
    pub fn new(
        config: SessionConfig,
        credential: impl Into<String>,
        dynamic_variables: HashMap<String, String>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let closing = ClosingPhrases::new(&config.closing_phrases);
        let max_pending = config.max_pending_chunks;

        let inner = Inner {
            config,
            credential: credential.into(),
            dynamic_variables,
            closing,
            link: Mutex::new(LinkState {
                gate: ReadinessGate::new(max_pending),
                outbound: None,
            }),
            events: events_tx,
            shutdown: shutdown_tx,
            chunk_counter: AtomicU64::new(0),
            ending_flagged: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            task: Mutex::new(None),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.link.lock().gate.phase()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.link.lock().gate.is_ready()
    }

    /// Number of agent audio chunks received so far.
    pub fn chunks_received(&self) -> u64 {
        self.inner.chunk_counter.load(Ordering::SeqCst)
    }

    pub async fn connect(&self) -> AppResult<()> {
        if self.inner.disconnected.load(Ordering::SeqCst) {
            return Err(AppError::Session("Session already closed".to_string()));
        }
        if self.inner.task.lock().is_some() {
            return Err(AppError::Session("Session already connected".to_string()));
        }

        self.inner.link.lock().gate.begin_connect();
        let socket = match self.inner.open_socket().await {
            Ok(socket) => socket,
            Err(e) => {
                self.inner.link.lock().gate.end();
                error!("Session handshake failed: {}", e);
                return Err(e);
            }
        };

        self.inner.link.lock().gate.opened();
        self.inner.emit(SessionEvent::Connected);
        info!("Conversation session connected");

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run(socket).await });
        *self.inner.task.lock() = Some(handle);
        Ok(())
    }

    /// Queue one frame of captured audio for the service.
    ///
    /// A no-op once the session ended; buffered while the session is not ready.
    pub fn send_audio_chunk(&self, chunk: &[u8]) -> AppResult<()> {
        let mut link = self.inner.link.lock();
        match link.gate.offer(chunk.to_vec()) {
            SendDecision::Discarded | SendDecision::Buffered => Ok(()),
            SendDecision::Send(pcm) => {
                let message = Message::Text(OutboundMessage::audio(&pcm).to_json()?);
                match link.outbound.as_ref() {
                    Some(tx) => tx
                        .send(message)
                        .map_err(|_| AppError::Session("Session connection closed".to_string())),
                    None => Err(AppError::Session("Session has no connection".to_string())),
                }
            }
        }
    }

    pub async fn disconnect(&self) {
        if self.inner.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut link = self.inner.link.lock();
            link.gate.end();
            link.outbound = None;
        }
        self.inner.shutdown.send_replace(true);

        let task = self.inner.task.lock().take();
        if let Some(mut handle) = task {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("Session task did not stop in time, aborting");
                handle.abort();
            }
        }

        self.inner.emit(SessionEvent::Disconnected {
            reason: "client disconnect".to_string(),
        });
        info!(
            chunks_received = self.chunks_received(),
            "Conversation session disconnected"
        );
    }
}

#[async_trait]
impl ConversationLink for SessionClient {
    async fn connect(&self) -> AppResult<()> {
        SessionClient::connect(self).await
    }

    fn send_audio_chunk(&self, chunk: &[u8]) -> AppResult<()> {
        SessionClient::send_audio_chunk(self, chunk)
    }

    async fn disconnect(&self) {
        SessionClient::disconnect(self).await
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        // The consumer may already be gone during teardown.
        let _ = self.events.send(event);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn open_socket(&self) -> AppResult<Socket> {
        let endpoint = self.config.endpoint();
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| AppError::Handshake(format!("Bad endpoint {}: {}", endpoint, e)))?;

        if !self.credential.is_empty() {
            let value = HeaderValue::from_str(&self.credential)
                .map_err(|e| AppError::Handshake(format!("Invalid credential header: {}", e)))?;
            request.headers_mut().insert("xi-api-key", value);
        }

        debug!("Connecting to {}", self.config.url);
        match tokio::time::timeout(
            self.config.ready_timeout(),
            tokio_tungstenite::connect_async(request),
        )
        .await
        {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => Err(AppError::Handshake(format!("Connect failed: {}", e))),
            Err(_) => Err(AppError::Handshake(format!(
                "Connect timed out after {}ms",
                self.config.ready_timeout_ms
            ))),
        }
    }

    /// Connection task: drive the socket, reconnect on drops.
    async fn run(self: Arc<Self>, first: Socket) {
        let mut socket = first;
        let mut attempt: u32 = 0;

        loop {
            let reason = match self.drive(socket).await {
                ConnectionOutcome::Shutdown => return,
                ConnectionOutcome::Dropped {
                    reason,
                    reached_ready,
                } => {
                    if reached_ready {
                        attempt = 0;
                    }
                    reason
                }
            };
            warn!("Session dropped: {}", reason);

            match self.reconnect(&mut attempt).await {
                Some(next) => socket = next,
                None => return,
            }
        }
    }

    /// Retry the handshake until it succeeds, attempts run out, or shutdown.
    async fn reconnect(&self, attempt: &mut u32) -> Option<Socket> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if self.is_shutting_down() {
                return None;
            }

            *attempt += 1;
            if *attempt > self.config.max_reconnect_attempts {
                let reason = format!(
                    "Reconnect failed after {} attempts",
                    self.config.max_reconnect_attempts
                );
                error!("{}", reason);
                {
                    let mut link = self.link.lock();
                    link.gate.end();
                    link.outbound = None;
                }
                self.emit(SessionEvent::Failed { reason });
                return None;
            }

            let discarded = self.link.lock().gate.reset_for_reconnect(*attempt);
            if discarded > 0 {
                debug!("Discarded {} buffered chunks before reconnect", discarded);
            }
            self.emit(SessionEvent::Reconnecting { attempt: *attempt });
            info!(
                "Reconnecting session (attempt {}/{})",
                attempt, self.config.max_reconnect_attempts
            );

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                _ = shutdown.changed() => return None,
            }

            match self.open_socket().await {
                Ok(socket) => {
                    if self.is_shutting_down() {
                        return None;
                    }
                    self.link.lock().gate.opened();
                    self.emit(SessionEvent::Connected);
                    info!("Session reconnected");
                    return Some(socket);
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }

    /// Pump one socket until it closes or the session shuts down.
    async fn drive(self: &Arc<Self>, socket: Socket) -> ConnectionOutcome {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return ConnectionOutcome::Shutdown;
        }

        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let generation = {
            let mut link = self.link.lock();
            link.outbound = Some(outbound_tx);
            link.gate.generation()
        };

        let keepalive = self.config.keepalive_interval();
        let mut ping = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
        let ready_deadline = tokio::time::sleep(self.config.ready_timeout());
        tokio::pin!(ready_deadline);
        let mut awaiting_metadata = true;

        let dropped = |reason: String, awaiting: bool| ConnectionOutcome::Dropped {
            reason,
            reached_ready: !awaiting,
        };

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return ConnectionOutcome::Shutdown;
                }

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let message = match parse_inbound(&text) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!("{}", e);
                                continue;
                            }
                        };

                        if matches!(message, InboundMessage::ConversationInitiationMetadata { .. }) {
                            awaiting_metadata = false;
                            let context = OutboundMessage::client_data(self.dynamic_variables.clone());
                            debug!("Sending call context: {}", describe_client_data(&self.dynamic_variables));
                            let sent = match context.to_json() {
                                Ok(json) => sink.send(Message::Text(json)).await,
                                Err(e) => {
                                    error!("Failed to encode call context: {}", e);
                                    continue;
                                }
                            };
                            if let Err(e) = sent {
                                return dropped(format!("Send failed: {}", e), awaiting_metadata);
                            }
                            self.schedule_ready(generation);
                            continue;
                        }

                        if let Some(reply) = self.handle_inbound(message) {
                            if let Err(e) = sink.send(reply).await {
                                return dropped(format!("Send failed: {}", e), awaiting_metadata);
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("closed by server: {} {}", f.code, f.reason))
                            .unwrap_or_else(|| "closed by server".to_string());
                        return dropped(reason, awaiting_metadata);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return dropped(format!("Socket error: {}", e), awaiting_metadata),
                    None => return dropped("Socket closed".to_string(), awaiting_metadata),
                },

                Some(message) = outbound_rx.recv() => {
                    if let Err(e) = sink.send(message).await {
                        return dropped(format!("Send failed: {}", e), awaiting_metadata);
                    }
                }

                _ = ping.tick() => {
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        return dropped(format!("Keep-alive failed: {}", e), awaiting_metadata);
                    }
                }

                _ = &mut ready_deadline, if awaiting_metadata => {
                    return dropped(
                        format!("No initiation metadata within {}ms", self.config.ready_timeout_ms),
                        true,
                    );
                }
            }
        }
    }

    /// Open the gate after the settle delay, unless the connection changed meanwhile.
    fn schedule_ready(self: &Arc<Self>, generation: u64) {
        let inner = self.clone();
        let settle = self.config.ready_settle();
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let flushed = {
                let mut link = inner.link.lock();
                let Some(pending) = link.gate.mark_ready(generation) else {
                    return;
                };
                inner.emit(SessionEvent::Ready);
                let count = pending.len();
                if let Some(tx) = link.outbound.as_ref() {
                    for pcm in pending {
                        match OutboundMessage::audio(&pcm).to_json() {
                            Ok(json) => {
                                let _ = tx.send(Message::Text(json));
                            }
                            Err(e) => warn!("Dropping buffered chunk: {}", e),
                        }
                    }
                }
                count
            };
            if flushed > 0 {
                debug!("Flushed {} buffered chunks", flushed);
            }
        });
    }

    /// Turn one inbound message into events; returns a reply to send, if any.
    fn handle_inbound(&self, message: InboundMessage) -> Option<Message> {
        match message {
            InboundMessage::ConversationInitiationMetadata { .. } => None,
            InboundMessage::Audio { audio_event } => {
                match audio_event.decode() {
                    Ok(audio) => {
                        let chunk_id = self.chunk_counter.fetch_add(1, Ordering::SeqCst) + 1;
                        self.emit(SessionEvent::AudioChunk {
                            chunk_id,
                            audio,
                            end_ms: audio_event.audio_end_ms,
                        });
                    }
                    Err(e) => warn!("{}", e),
                }
                None
            }
            InboundMessage::UserTranscript {
                user_transcription_event: event,
            } => {
                self.emit(SessionEvent::UserTranscript {
                    text: event.user_transcript,
                    is_final: event.is_final,
                    confidence: event.confidence,
                });
                None
            }
            InboundMessage::AgentResponse {
                agent_response_event: event,
            } => {
                let text = event.agent_response;
                let ending = self.closing.matches(&text)
                    && !self.ending_flagged.swap(true, Ordering::SeqCst);
                self.emit(SessionEvent::AgentResponse { text: text.clone() });
                if ending {
                    info!("Agent is closing the conversation");
                    self.emit(SessionEvent::ConversationEnding { text });
                }
                None
            }
            InboundMessage::Interruption { .. } => {
                self.emit(SessionEvent::Interruption);
                None
            }
            InboundMessage::ModeChange { mode_change_event } => {
                debug!("Agent mode: {}", mode_change_event.mode);
                self.emit(SessionEvent::ModeChange(mode_change_event.mode));
                None
            }
            InboundMessage::Ping { ping_event } => OutboundMessage::pong(ping_event.event_id)
                .to_json()
                .ok()
                .map(Message::Text),
            InboundMessage::Pong { .. } | InboundMessage::Unknown => None,
        }
    }
}
