//! # Capture Relay WebSocket
//!
//! The in-page capture script connects to `/ws/capture?call_id=<id>` and
//! streams the call's remote audio as binary PCM frames.
//!
//! ## Protocol:
//! - **Page → Server (binary)**: 16-bit 16kHz mono PCM frames, in capture order
//! - **Page → Server (JSON)**: `capture_started`, `device_selected`,
//!   `capture_error`, `pong`
//! - **Server → Page (JSON)**: `ping` heartbeat, `clear_playback`, `error`
//! - **Server → Page (binary)**: agent audio for in-page playback
//!
//! Frames are forwarded to the call's capture queue one at a time. When the
//! queue is full the actor waits before reading the next frame, so order is
//! kept and the page is slowed down instead of frames being dropped. Once the
//! call is torn down the connection is closed quietly.

use crate::audio::processor::AudioChunk;
use crate::relay::hub::PageCommand;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// JSON control messages on the relay socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// The page's audio graph is running.
    CaptureStarted,
    /// The page fell back to a local input device.
    DeviceSelected { device_id: String, label: String },
    /// The page could not start capturing.
    CaptureError { message: String },
    Ping { timestamp: u64 },
    Pong,
    /// Stop whatever agent audio the page is playing.
    ClearPlayback,
    Error { code: String, message: String },
}

/// One page connection for one call.
pub struct CaptureWebSocket {
    call_id: String,
    state: web::Data<AppState>,
    capture_tx: Option<mpsc::Sender<AudioChunk>>,
    page_tx: Option<mpsc::UnboundedSender<PageCommand>>,
    last_heartbeat: Instant,
    frames: u64,
}

impl CaptureWebSocket {
    pub fn new(call_id: String, state: web::Data<AppState>) -> Self {
        Self {
            call_id,
            state,
            capture_tx: None,
            page_tx: None,
            last_heartbeat: Instant::now(),
            frames: 0,
        }
    }

    fn send_json(&self, ctx: &mut ws::WebsocketContext<Self>, message: &RelayMessage) {
        if let Ok(json) = serde_json::to_string(message) {
            ctx.text(json);
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send_json(
            ctx,
            &RelayMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
        warn!(call_id = %self.call_id, "Relay error {}: {}", code, message);
    }

    /// The call side went away; close without fuss.
    fn capture_closed(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        debug!(call_id = %self.call_id, "Capture queue closed, closing relay");
        self.capture_tx = None;
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }

    fn handle_audio(&mut self, data: Vec<u8>, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(tx) = self.capture_tx.clone() else {
            return;
        };
        self.frames += 1;
        self.state.record_relayed_frame(data.len());

        match tx.try_send(AudioChunk::new(data)) {
            Ok(()) => {}
            Err(TrySendError::Full(chunk)) => {
                // Hold the mailbox until the call side catches up.
                ctx.wait(
                    async move { tx.send(chunk).await.is_ok() }
                        .into_actor(self)
                        .map(|delivered, act, ctx| {
                            if !delivered {
                                act.capture_closed(ctx);
                            }
                        }),
                );
            }
            Err(TrySendError::Closed(_)) => self.capture_closed(ctx),
        }
    }

    fn handle_control(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<RelayMessage>(text) {
            Ok(RelayMessage::CaptureStarted) => {
                info!(call_id = %self.call_id, "Page capture started");
            }
            Ok(RelayMessage::DeviceSelected { device_id, label }) => {
                info!(call_id = %self.call_id, device_id = %device_id, "Page capturing from '{}'", label);
            }
            Ok(RelayMessage::CaptureError { message }) => {
                error!(call_id = %self.call_id, "Page capture failed: {}", message);
                self.state.record_capture_error();
            }
            Ok(RelayMessage::Pong) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(other) => {
                warn!(call_id = %self.call_id, "Unexpected relay message: {:?}", other);
            }
            Err(err) => {
                self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
            }
        }
    }
}

impl Actor for CaptureWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (page_tx, page_rx) = mpsc::unbounded_channel();
        match self.state.hub.attach_page(&self.call_id, page_tx.clone()) {
            Ok(capture_tx) => {
                self.capture_tx = Some(capture_tx);
                self.page_tx = Some(page_tx);
                ctx.add_stream(UnboundedReceiverStream::new(page_rx));
                self.state.relay_connected();
                info!(call_id = %self.call_id, "Capture relay connected");
            }
            Err(e) => {
                self.send_error(ctx, "unknown_call", &e.to_string());
                ctx.close(Some(ws::CloseCode::Policy.into()));
                ctx.stop();
                return;
            }
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(call_id = %act.call_id, "Relay heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
            act.send_json(ctx, &RelayMessage::Ping { timestamp });
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.capture_tx = None;
        if let Some(page_tx) = self.page_tx.take() {
            self.state.relay_disconnected();
            self.state.hub.detach_page(&self.call_id, &page_tx);
        }
        info!(call_id = %self.call_id, frames = self.frames, "Capture relay closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CaptureWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_audio(data.to_vec(), ctx);
            }
            Ok(ws::Message::Text(text)) => {
                self.handle_control(&text, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(call_id = %self.call_id, "Relay closed by page: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(call_id = %self.call_id, "Relay protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Commands pushed by the call side.
impl StreamHandler<PageCommand> for CaptureWebSocket {
    fn handle(&mut self, command: PageCommand, ctx: &mut Self::Context) {
        match command {
            PageCommand::Audio(pcm) => ctx.binary(pcm),
            PageCommand::ClearPlayback => self.send_json(ctx, &RelayMessage::ClearPlayback),
            PageCommand::Close => {
                debug!(call_id = %self.call_id, "Call torn down, closing relay");
                self.capture_tx = None;
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.stop();
    }
}

/// Upgrade handler for `GET /ws/capture?call_id=<id>`.
pub async fn capture_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let query = web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .unwrap_or_else(|_| web::Query(HashMap::new()));

    let Some(call_id) = query.get("call_id").filter(|id| !id.is_empty()).cloned() else {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "error": { "type": "bad_request", "message": "call_id query parameter is required" }
        })));
    };

    if !state.hub.is_bound(&call_id) {
        warn!(call_id = %call_id, "Relay connection for unknown call");
        return Ok(HttpResponse::NotFound().json(serde_json::json!({
            "error": { "type": "not_found", "message": format!("No active call {}", call_id) }
        })));
    }

    info!(
        call_id = %call_id,
        "Relay connection from {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(CaptureWebSocket::new(call_id, state), &req, stream)
}
