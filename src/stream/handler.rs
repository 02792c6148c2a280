//! # Audio Stream Handler
//!
//! Bridges call audio and the conversation for one call.
//!
//! ## Capture path:
//! relay → bounded capture queue → single consumer → recording → size gate →
//! playback-echo gate → session. Frames keep their arrival order.
//!
//! ## Playback path:
//! session audio events → FIFO playback queue → single player task → sink.
//! One chunk plays at a time, paced by its estimated duration. An
//! interruption empties the queue and cuts the chunk that is playing.
//!
//! ## Shutdown:
//! `stop_capture()` tears down in a fixed order and is safe to call from any
//! state, any number of times, from several tasks. `cleanup()` additionally
//! writes the recording.

use crate::audio::buffer::{RecordingBuffer, SegmentSource};
use crate::audio::playback::{AudioSink, PlaybackQueue, PlaybackQueueItem};
use crate::audio::processor::{AudioChunk, CaptureGate, GateVerdict};
use crate::audio::transcoder::{write_recording, PcmFormat, RecordingFile};
use crate::config::StreamConfig;
use crate::detector::watchdog::{spawn_after, ActivityClock};
use crate::driver::PageDriver;
use crate::error::{AppError, AppResult};
use crate::relay::hub::RelayHub;
use crate::session::{ConversationLink, SessionEvent};
use crate::stream::capture_script::{build_capture_script, TEARDOWN_SCRIPT};
use crate::stream::transcript::{ConversationTurn, Speaker, TranscriptLog};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// The hang-up action the handler runs when the conversation is over.
#[async_trait]
pub trait CallTerminator: Send + Sync {
    async fn hang_up(&self, reason: &str);
}

/// Why the handler stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop_capture()` or `cleanup()` called from outside.
    Requested,
    /// The conversation session failed for good (handshake or reconnects).
    ConversationFailed,
    /// Forwarding captured audio kept failing.
    ForwardingErrors,
    /// The capture script could not be injected into the page.
    CaptureUnavailable,
}

impl StopReason {
    /// Whether the stop should fail the call rather than end it.
    pub fn is_failure(&self) -> bool {
        !matches!(self, StopReason::Requested)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Requested => "audio stream stopped",
            StopReason::ConversationFailed => "conversation failed",
            StopReason::ForwardingErrors => "audio forwarding failed",
            StopReason::CaptureUnavailable => "capture unavailable",
        }
    }
}

/// Page the capture script is injected into.
pub struct PageAttachment {
    pub driver: Arc<dyn PageDriver>,
    pub relay_url: String,
}

#[derive(Default)]
struct PlaybackState {
    queue: PlaybackQueue,
    playing: bool,
    ending: bool,
    grace_armed: bool,
    last_chunk_id: Option<u64>,
}

struct Inner {
    call_id: String,
    config: StreamConfig,
    format: PcmFormat,
    recording_path: PathBuf,
    link: Arc<dyn ConversationLink>,
    sink: Arc<dyn AudioSink>,
    terminator: Arc<dyn CallTerminator>,
    activity: ActivityClock,
    page: Option<PageAttachment>,
    hub: Option<RelayHub>,

    recording: RecordingBuffer,
    transcript: TranscriptLog,
    gate: Mutex<CaptureGate>,
    playback: Mutex<PlaybackState>,
    playback_ready: Notify,
    interrupts: watch::Sender<u64>,

    capture_tx: mpsc::Sender<AudioChunk>,
    capture_rx: Mutex<Option<mpsc::Receiver<AudioChunk>>>,

    started: AtomicBool,
    accepting: AtomicBool,
    cleaning_up: AtomicBool,
    script_injected: AtomicBool,
    consecutive_errors: AtomicU32,
    forwarded: AtomicU64,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    grace_timer: Mutex<Option<JoinHandle<()>>>,
    stop_reason: Mutex<Option<StopReason>>,
    finished_tx: watch::Sender<bool>,
    finalized: OnceCell<Option<RecordingFile>>,
}

/// Audio orchestration for one call. Cloning shares the same handler.
#[derive(Clone)]
pub struct AudioStreamHandler {
    inner: Arc<Inner>,
}

/// Collects the optional page and relay before the handler is shared.
pub struct AudioStreamHandlerBuilder {
    call_id: String,
    config: StreamConfig,
    recording_path: PathBuf,
    link: Arc<dyn ConversationLink>,
    sink: Arc<dyn AudioSink>,
    terminator: Arc<dyn CallTerminator>,
    activity: ActivityClock,
    page: Option<PageAttachment>,
    hub: Option<RelayHub>,
}

impl AudioStreamHandlerBuilder {
    /// Page the capture script is injected into.
    pub fn with_page(mut self, page: PageAttachment) -> Self {
        self.page = Some(page);
        self
    }

    /// Route relay frames for this call into the handler.
    pub fn with_relay(mut self, hub: RelayHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn build(self) -> AudioStreamHandler {
        let config = self.config;
        let format = PcmFormat::from(&config);
        let (capture_tx, capture_rx) = mpsc::channel(config.capture_queue_capacity.max(1));
        let (interrupts, _) = watch::channel(0);
        let (finished_tx, _) = watch::channel(false);
        let gate = CaptureGate::new(config.min_chunk_bytes, config.playback_gate());

        AudioStreamHandler {
            inner: Arc::new(Inner {
                call_id: self.call_id,
                format,
                recording_path: self.recording_path,
                link: self.link,
                sink: self.sink,
                terminator: self.terminator,
                activity: self.activity,
                page: self.page,
                hub: self.hub,
                recording: RecordingBuffer::new(format),
                transcript: TranscriptLog::new(),
                gate: Mutex::new(gate),
                playback: Mutex::new(PlaybackState::default()),
                playback_ready: Notify::new(),
                interrupts,
                capture_tx,
                capture_rx: Mutex::new(Some(capture_rx)),
                started: AtomicBool::new(false),
                accepting: AtomicBool::new(false),
                cleaning_up: AtomicBool::new(false),
                script_injected: AtomicBool::new(false),
                consecutive_errors: AtomicU32::new(0),
                forwarded: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
                grace_timer: Mutex::new(None),
                stop_reason: Mutex::new(None),
                finished_tx,
                finalized: OnceCell::new(),
                config,
            }),
        }
    }
}

impl AudioStreamHandler {
    /// Handler without a page or relay. See [`AudioStreamHandler::builder`].
    pub fn new(
        call_id: impl Into<String>,
        config: StreamConfig,
        recording_path: PathBuf,
        link: Arc<dyn ConversationLink>,
        sink: Arc<dyn AudioSink>,
        terminator: Arc<dyn CallTerminator>,
        activity: ActivityClock,
    ) -> Self {
        Self::builder(call_id, config, recording_path, link, sink, terminator, activity).build()
    }

    pub fn builder(
        call_id: impl Into<String>,
        config: StreamConfig,
        recording_path: PathBuf,
        link: Arc<dyn ConversationLink>,
        sink: Arc<dyn AudioSink>,
        terminator: Arc<dyn CallTerminator>,
        activity: ActivityClock,
    ) -> AudioStreamHandlerBuilder {
        AudioStreamHandlerBuilder {
            call_id: call_id.into(),
            config,
            recording_path,
            link,
            sink,
            terminator,
            activity,
            page: None,
            hub: None,
        }
    }

    /// Sender side of the capture queue.
    pub fn capture_sender(&self) -> mpsc::Sender<AudioChunk> {
        self.inner.capture_tx.clone()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.inner.playback.lock().playing
    }

    pub fn queued_playback(&self) -> usize {
        self.inner.playback.lock().queue.len()
    }

    pub fn forwarded_frames(&self) -> u64 {
        self.inner.forwarded.load(Ordering::SeqCst)
    }

    pub fn recording(&self) -> &RecordingBuffer {
        &self.inner.recording
    }

    pub fn transcript(&self) -> Vec<ConversationTurn> {
        self.inner.transcript.turns()
    }

    /// Set once the handler has begun stopping.
    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.inner.stop_reason.lock()
    }

    /// Connect the conversation and begin accepting captured audio.
    ///
    /// Nothing is accepted unless the conversation connects.
    pub async fn start(
        &self,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> AppResult<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::Internal("Stream handler already started".to_string()));
        }
        if inner.cleaning_up.load(Ordering::SeqCst) {
            return Err(AppError::Session("Stream handler already stopped".to_string()));
        }

        inner.link.connect().await?;

        if inner.cleaning_up.load(Ordering::SeqCst) {
            inner.link.disconnect().await;
            return Err(AppError::Session(
                "Stream handler stopped while connecting".to_string(),
            ));
        }

        let capture_rx = inner
            .capture_rx
            .lock()
            .take()
            .ok_or_else(|| AppError::Internal("Capture queue already taken".to_string()))?;

        if let Some(hub) = &inner.hub {
            hub.bind(&inner.call_id, inner.capture_tx.clone());
        }
        inner.accepting.store(true, Ordering::SeqCst);

        {
            let mut tasks = inner.tasks.lock();
            tasks.push(tokio::spawn(inner.clone().run_capture(capture_rx)));
            tasks.push(tokio::spawn(inner.clone().run_player()));
            tasks.push(tokio::spawn(inner.clone().run_events(events)));
        }
        info!(call_id = %inner.call_id, "Audio streaming started");

        if let Some(page) = &inner.page {
            let script = build_capture_script(
                &page.relay_url,
                &inner.call_id,
                inner.format.sample_rate,
            );
            if let Err(e) = page.driver.inject_script(&script).await {
                error!(call_id = %inner.call_id, "Capture script injection failed: {}", e);
                inner.stop_capture(StopReason::CaptureUnavailable).await;
                return Err(e);
            }
            inner.script_injected.store(true, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Tear everything down. Idempotent; safe before `start()`.
    pub async fn stop_capture(&self) {
        self.inner.stop_capture(StopReason::Requested).await;
    }

    /// `stop_capture()`, then write the recording once.
    ///
    /// Returns `None` when no audio was recorded.
    pub async fn cleanup(&self) -> AppResult<Option<RecordingFile>> {
        self.inner.stop_capture(StopReason::Requested).await;
        let inner = &self.inner;
        let file = inner
            .finalized
            .get_or_try_init(|| async {
                let file = write_recording(
                    &inner.recording_path,
                    &inner.recording.segments(),
                    inner.format,
                )
                .await?;
                match &file {
                    Some(f) => info!(
                        call_id = %inner.call_id,
                        path = %f.path.display(),
                        duration_ms = f.duration.as_millis() as u64,
                        "Recording finalized"
                    ),
                    None => info!(call_id = %inner.call_id, "No audio recorded"),
                }
                Ok::<_, AppError>(file)
            })
            .await?;
        Ok(file.clone())
    }

    /// Resolves once the handler has stopped, including internal stops.
    pub async fn finished(&self) {
        let mut rx = self.inner.finished_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl Inner {
    async fn run_capture(self: Arc<Self>, mut rx: mpsc::Receiver<AudioChunk>) {
        let max_errors = self.config.max_consecutive_errors;

        while let Some(chunk) = rx.recv().await {
            if self.cleaning_up.load(Ordering::SeqCst) {
                break;
            }
            if !self.accepting.load(Ordering::SeqCst) {
                continue;
            }

            self.activity.touch();
            if let Err(e) = self.recording.append(SegmentSource::Capture, &chunk.buffer) {
                debug!(call_id = %self.call_id, "Capture frame not recorded: {}", e);
            }

            let verdict = self.gate.lock().check(&chunk.buffer, Instant::now());
            match verdict {
                GateVerdict::Forward => {}
                GateVerdict::TooSmall => {
                    trace!("Dropped {} byte frame below size gate", chunk.len());
                    continue;
                }
                GateVerdict::PlaybackEcho => {
                    trace!("Dropped frame inside playback gate");
                    continue;
                }
                GateVerdict::Invalid(reason) => {
                    debug!("Dropped invalid frame: {}", reason);
                    continue;
                }
            }

            match self.link.send_audio_chunk(&chunk.buffer) {
                Ok(()) => {
                    self.consecutive_errors.store(0, Ordering::SeqCst);
                    self.forwarded.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    let errors = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(
                        call_id = %self.call_id,
                        "Forwarding failed ({}/{}): {}",
                        errors, max_errors, e
                    );
                    if errors >= max_errors {
                        error!(call_id = %self.call_id, "Too many forwarding errors, stopping capture");
                        self.accepting.store(false, Ordering::SeqCst);
                        self.spawn_stop(StopReason::ForwardingErrors);
                        break;
                    }
                }
            }
        }
    }

    async fn run_player(self: Arc<Self>) {
        let mut interrupts = self.interrupts.subscribe();

        loop {
            let next = {
                let mut state = self.playback.lock();
                if self.cleaning_up.load(Ordering::SeqCst) {
                    return;
                }
                match state.queue.pop() {
                    Some(item) => {
                        state.playing = true;
                        interrupts.borrow_and_update();
                        Some(item)
                    }
                    None => {
                        if state.ending && !state.grace_armed {
                            state.grace_armed = true;
                            self.arm_grace_timer();
                        }
                        None
                    }
                }
            };

            let Some(item) = next else {
                self.playback_ready.notified().await;
                continue;
            };

            // Interrupted between dequeue and play: the item is dropped.
            if interrupts.has_changed().unwrap_or(true) {
                interrupts.borrow_and_update();
                continue;
            }

            if let Err(e) = self.sink.play(&item.buffer).await {
                warn!(call_id = %self.call_id, "Playback of chunk {} failed: {}", item.chunk_id, e);
            }
            self.activity.touch();

            let pace = self.format.estimate_duration(item.buffer.len());
            tokio::select! {
                _ = tokio::time::sleep(pace) => {}
                _ = interrupts.changed() => {
                    debug!(call_id = %self.call_id, "Cutting off chunk {}", item.chunk_id);
                    self.sink.interrupt().await;
                }
            }

            self.playback.lock().playing = false;
            self.gate.lock().mark_playback_finished(Instant::now());
        }
    }

    async fn run_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::AudioChunk {
                    chunk_id, audio, ..
                } => {
                    if self.cleaning_up.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Err(e) = self.recording.append(SegmentSource::Agent, &audio) {
                        debug!(call_id = %self.call_id, "Agent chunk not recorded: {}", e);
                    }
                    self.activity.touch();
                    {
                        let mut state = self.playback.lock();
                        state.last_chunk_id = Some(chunk_id);
                        state.queue.push(PlaybackQueueItem::new(chunk_id, audio));
                    }
                    self.playback_ready.notify_one();
                }
                SessionEvent::UserTranscript { text, is_final, .. } => {
                    if is_final {
                        debug!(call_id = %self.call_id, "Contact: {}", text);
                        self.transcript.append(Speaker::Contact, text, None);
                    }
                }
                SessionEvent::AgentResponse { text } => {
                    debug!(call_id = %self.call_id, "Agent: {}", text);
                    let chunk_id = self.playback.lock().last_chunk_id;
                    self.transcript.append(Speaker::Agent, text, chunk_id);
                }
                SessionEvent::Interruption => {
                    let dropped = self.interrupt_playback();
                    info!(call_id = %self.call_id, dropped, "Contact interrupted the agent");
                }
                SessionEvent::ModeChange(mode) => {
                    trace!(call_id = %self.call_id, "Agent mode: {}", mode);
                }
                SessionEvent::ConversationEnding { .. } => {
                    info!(call_id = %self.call_id, "Conversation ending, waiting for playback to drain");
                    self.playback.lock().ending = true;
                    self.playback_ready.notify_one();
                }
                SessionEvent::Ready => {
                    info!(call_id = %self.call_id, "Conversation ready");
                }
                SessionEvent::Connected => {
                    debug!(call_id = %self.call_id, "Conversation connected");
                }
                SessionEvent::Reconnecting { attempt } => {
                    warn!(call_id = %self.call_id, attempt, "Conversation reconnecting");
                }
                SessionEvent::Disconnected { reason } => {
                    debug!(call_id = %self.call_id, "Conversation disconnected: {}", reason);
                }
                SessionEvent::Failed { reason } => {
                    error!(call_id = %self.call_id, "Conversation failed: {}", reason);
                    self.spawn_stop(StopReason::ConversationFailed);
                }
            }
        }
    }

    /// Empty the playback queue and cut the chunk in flight.
    fn interrupt_playback(&self) -> usize {
        let mut state = self.playback.lock();
        let dropped = state.queue.clear();
        state.playing = false;
        self.interrupts.send_modify(|generation| *generation += 1);
        dropped
    }

    fn arm_grace_timer(self: &Arc<Self>) {
        let terminator = self.terminator.clone();
        let call_id = self.call_id.clone();
        let grace = self.config.ending_grace();
        info!(call_id = %self.call_id, "Hanging up in {}ms", grace.as_millis());
        let handle = spawn_after(grace, async move {
            info!(call_id = %call_id, "Grace period over, hanging up");
            terminator.hang_up("conversation ended").await;
        });
        if let Some(old) = self.grace_timer.lock().replace(handle) {
            old.abort();
        }
    }

    /// Stop from inside one of the handler's own tasks.
    fn spawn_stop(self: &Arc<Self>, reason: StopReason) {
        let inner = self.clone();
        tokio::spawn(async move { inner.stop_capture(reason).await });
    }

    async fn stop_capture(&self, reason: StopReason) {
        if self.cleaning_up.swap(true, Ordering::SeqCst) {
            // Another caller is tearing down; wait for it.
            let mut rx = self.finished_tx.subscribe();
            let _ = rx.wait_for(|done| *done).await;
            return;
        }
        *self.stop_reason.lock() = Some(reason);
        info!(call_id = %self.call_id, reason = reason.as_str(), "Stopping audio streaming");

        self.accepting.store(false, Ordering::SeqCst);

        if self.started.load(Ordering::SeqCst) {
            self.link.disconnect().await;
        }

        let dropped = self.interrupt_playback();
        if dropped > 0 {
            debug!(call_id = %self.call_id, dropped, "Discarded queued playback");
        }
        if let Some(rx) = self.capture_rx.lock().as_mut() {
            while rx.try_recv().is_ok() {}
        }
        if let Some(timer) = self.grace_timer.lock().take() {
            timer.abort();
        }

        self.sink.stop().await;

        if self.script_injected.load(Ordering::SeqCst) {
            if let Some(page) = &self.page {
                if let Err(e) = page.driver.evaluate(TEARDOWN_SCRIPT).await {
                    warn!(call_id = %self.call_id, "Capture teardown failed: {}", e);
                }
            }
        }

        if let Some(hub) = &self.hub {
            hub.unbind(&self.call_id);
        }

        // Queued capture frames go away with the consumer's receiver.
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.playback_ready.notify_one();

        self.finished_tx.send_replace(true);
        let gate = self.gate.lock().stats();
        info!(
            call_id = %self.call_id,
            forwarded = self.forwarded.load(Ordering::SeqCst),
            dropped_small = gate.too_small,
            dropped_echo = gate.echo,
            "Audio streaming stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::fake::RecordingSink;
    use crate::driver::fake::FakePage;
    use crate::session::client::fake::FakeLink;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingTerminator {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CallTerminator for CountingTerminator {
        async fn hang_up(&self, reason: &str) {
            self.calls.lock().push(reason.to_string());
        }
    }

    struct Fixture {
        handler: AudioStreamHandler,
        link: Arc<FakeLink>,
        sink: Arc<RecordingSink>,
        terminator: Arc<CountingTerminator>,
        events: mpsc::UnboundedSender<SessionEvent>,
        events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
        _dir: tempfile::TempDir,
    }

    fn fixture(link: FakeLink) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let link = Arc::new(link);
        let sink = Arc::new(RecordingSink::new());
        let terminator = Arc::new(CountingTerminator::default());
        let (events, events_rx) = mpsc::unbounded_channel();
        let handler = AudioStreamHandler::new(
            "call-test",
            StreamConfig::default(),
            dir.path().join("call-test.wav"),
            link.clone(),
            sink.clone(),
            terminator.clone(),
            ActivityClock::new(),
        );
        Fixture {
            handler,
            link,
            sink,
            terminator,
            events,
            events_rx: Some(events_rx),
            _dir: dir,
        }
    }

    async fn started(link: FakeLink) -> Fixture {
        let mut fx = fixture(link);
        let rx = fx.events_rx.take().unwrap();
        fx.handler.start(rx).await.unwrap();
        fx
    }

    fn frame(len: usize, fill: u8) -> AudioChunk {
        AudioChunk::new(vec![fill; len])
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_failure_never_accepts() {
        let mut link = FakeLink::new();
        link.fail_handshake = true;
        let mut fx = fixture(link);
        let rx = fx.events_rx.take().unwrap();

        assert!(matches!(fx.handler.start(rx).await, Err(AppError::Handshake(_))));
        assert!(!fx.handler.is_accepting());

        fx.handler.capture_sender().send(frame(640, 1)).await.unwrap();
        settle().await;
        assert_eq!(fx.link.send_attempts(), 0);
        assert!(fx.handler.recording().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_frames_never_forwarded() {
        let fx = started(FakeLink::new()).await;
        let capture = fx.handler.capture_sender();

        capture.send(frame(100, 1)).await.unwrap();
        capture.send(frame(318, 2)).await.unwrap();
        capture.send(frame(320, 3)).await.unwrap();
        settle().await;

        assert_eq!(fx.link.sent(), vec![vec![3u8; 320]]);
        // Every frame is still part of the recording.
        assert_eq!(fx.handler.recording().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_gate_drops_echo_then_forwards() {
        let fx = started(FakeLink::new()).await;
        let capture = fx.handler.capture_sender();

        // 3200 bytes = 100ms of agent audio.
        fx.events
            .send(SessionEvent::AudioChunk {
                chunk_id: 1,
                audio: vec![0; 3200],
                end_ms: None,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!fx.handler.is_playing());

        capture.send(frame(640, 1)).await.unwrap();
        settle().await;
        assert!(fx.link.sent().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        capture.send(frame(640, 2)).await.unwrap();
        settle().await;
        assert_eq!(fx.link.sent(), vec![vec![2u8; 640]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interruption_clears_queue() {
        let fx = started(FakeLink::new()).await;

        for chunk_id in 1..=3 {
            fx.events
                .send(SessionEvent::AudioChunk {
                    chunk_id,
                    audio: vec![chunk_id as u8; 32_000],
                    end_ms: None,
                })
                .unwrap();
        }
        settle().await;
        assert!(fx.handler.is_playing());
        assert_eq!(fx.handler.queued_playback(), 2);

        fx.events.send(SessionEvent::Interruption).unwrap();
        settle().await;
        assert_eq!(fx.handler.queued_playback(), 0);
        assert!(!fx.handler.is_playing());
        assert_eq!(fx.sink.interrupts(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fx.sink.played(), vec![vec![1u8; 32_000]]);

        // Playback resumes with audio that arrives afterwards.
        fx.events
            .send(SessionEvent::AudioChunk {
                chunk_id: 4,
                audio: vec![4; 320],
                end_ms: None,
            })
            .unwrap();
        settle().await;
        assert_eq!(fx.sink.played().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_play_one_at_a_time_in_order() {
        let fx = started(FakeLink::new()).await;
        for chunk_id in 1..=3 {
            fx.events
                .send(SessionEvent::AudioChunk {
                    chunk_id,
                    audio: vec![chunk_id as u8; 16_000],
                    end_ms: None,
                })
                .unwrap();
        }
        settle().await;
        assert_eq!(fx.sink.played().len(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.sink.played().len(), 2);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let played = fx.sink.played();
        assert_eq!(played.len(), 3);
        assert_eq!(played[2][0], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_capture_twice() {
        let page = Arc::new(FakePage::new());
        let dir = tempfile::tempdir().unwrap();
        let link = Arc::new(FakeLink::new());
        let sink = Arc::new(RecordingSink::new());
        let terminator = Arc::new(CountingTerminator::default());
        let hub = RelayHub::new();
        let handler = AudioStreamHandler::builder(
            "call-test",
            StreamConfig::default(),
            dir.path().join("call.wav"),
            link.clone(),
            sink.clone(),
            terminator.clone(),
            ActivityClock::new(),
        )
        .with_page(PageAttachment {
            driver: page.clone(),
            relay_url: "ws://127.0.0.1:8080/ws/capture".to_string(),
        })
        .with_relay(hub.clone())
        .build();

        let (_events, rx) = mpsc::unbounded_channel();
        handler.start(rx).await.unwrap();
        assert_eq!(page.count_actions("inject:"), 1);
        assert!(hub.is_bound("call-test"));

        handler.stop_capture().await;
        tokio::time::timeout(Duration::from_secs(1), handler.stop_capture())
            .await
            .unwrap();
        assert_eq!(handler.stop_reason(), Some(StopReason::Requested));

        assert_eq!(link.disconnects(), 1);
        assert_eq!(sink.stops(), 1);
        assert_eq!(page.count_actions("evaluate:"), 1);
        assert!(!hub.is_bound("call-test"));
        assert!(terminator.calls.lock().is_empty());
        assert!(!handler.is_accepting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start() {
        let fx = fixture(FakeLink::new());
        fx.handler.stop_capture().await;
        fx.handler.stop_capture().await;
        assert_eq!(fx.link.disconnects(), 0);
        assert_eq!(fx.sink.stops(), 1);
        assert!(fx.handler.cleanup().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_teardown_completes_without_waiters() {
        let fx = fixture(FakeLink::new());
        fx.handler.stop_capture().await;

        let second = tokio::time::timeout(Duration::from_secs(2), fx.handler.stop_capture()).await;
        assert!(second.is_ok());
        let finished = tokio::time::timeout(Duration::from_secs(2), fx.handler.finished()).await;
        assert!(finished.is_ok());
        let cleanup = tokio::time::timeout(Duration::from_secs(2), fx.handler.cleanup()).await;
        assert!(cleanup.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injection_failure_stops_and_cleanup_returns() {
        let page = Arc::new(FakePage::new());
        page.fail_injection(true);
        let dir = tempfile::tempdir().unwrap();
        let link = Arc::new(FakeLink::new());
        let hub = RelayHub::new();
        let handler = AudioStreamHandler::builder(
            "call-test",
            StreamConfig::default(),
            dir.path().join("call.wav"),
            link.clone(),
            Arc::new(RecordingSink::new()),
            Arc::new(CountingTerminator::default()),
            ActivityClock::new(),
        )
        .with_page(PageAttachment {
            driver: page.clone(),
            relay_url: "ws://127.0.0.1:8080/ws/capture".to_string(),
        })
        .with_relay(hub.clone())
        .build();

        let (_events, rx) = mpsc::unbounded_channel();
        assert!(handler.start(rx).await.is_err());
        assert_eq!(handler.stop_reason(), Some(StopReason::CaptureUnavailable));
        assert!(!handler.is_accepting());
        assert!(!hub.is_bound("call-test"));
        // Never injected, so nothing to tear down in the page.
        assert_eq!(page.count_actions("evaluate:"), 0);

        let cleanup = tokio::time::timeout(Duration::from_secs(2), handler.cleanup()).await;
        assert!(cleanup.unwrap().unwrap().is_none());
        assert_eq!(link.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_errors_stop_capture() {
        let mut link = FakeLink::new();
        link.fail_sends_from = Some(0);
        let fx = started(link).await;
        let capture = fx.handler.capture_sender();

        for i in 0..11u8 {
            // The 11th send may find the queue closed; that is fine.
            let _ = capture.send(frame(640, i)).await;
        }
        fx.handler.finished().await;

        assert_eq!(fx.handler.stop_reason(), Some(StopReason::ForwardingErrors));
        assert_eq!(fx.link.send_attempts(), 10);
        assert!(!fx.handler.is_accepting());
        assert_eq!(fx.link.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_forwarded_in_arrival_order() {
        let fx = started(FakeLink::new()).await;
        let capture = fx.handler.capture_sender();

        for i in 0..12u8 {
            capture.send(frame(640, i)).await.unwrap();
        }
        settle().await;

        assert!(fx.handler.is_accepting());
        assert_eq!(fx.handler.forwarded_frames(), 12);
        let order: Vec<u8> = fx.link.sent().iter().map(|f| f[0]).collect();
        assert_eq!(order, (0..12u8).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_failure_stops_capture() {
        let fx = started(FakeLink::new()).await;
        fx.events
            .send(SessionEvent::Failed {
                reason: "reconnects exhausted".to_string(),
            })
            .unwrap();
        fx.handler.finished().await;
        assert!(!fx.handler.is_accepting());
        assert_eq!(fx.handler.stop_reason(), Some(StopReason::ConversationFailed));
        assert!(fx.handler.stop_reason().unwrap().is_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversation_ending_hangs_up_after_grace() {
        let fx = started(FakeLink::new()).await;

        fx.events
            .send(SessionEvent::AudioChunk {
                chunk_id: 1,
                audio: vec![0; 32_000],
                end_ms: None,
            })
            .unwrap();
        fx.events
            .send(SessionEvent::ConversationEnding {
                text: "Goodbye!".to_string(),
            })
            .unwrap();

        // 1s of playback plus the 8s grace period.
        tokio::time::sleep(Duration::from_millis(8_500)).await;
        assert!(fx.terminator.calls.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(
            fx.terminator.calls.lock().clone(),
            vec!["conversation ended".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcript_turns() {
        let fx = started(FakeLink::new()).await;
        fx.events
            .send(SessionEvent::AudioChunk {
                chunk_id: 7,
                audio: vec![0; 320],
                end_ms: None,
            })
            .unwrap();
        fx.events
            .send(SessionEvent::AgentResponse {
                text: "Hi Ada, do you have a minute?".to_string(),
            })
            .unwrap();
        fx.events
            .send(SessionEvent::UserTranscript {
                text: "sure".to_string(),
                is_final: false,
                confidence: None,
            })
            .unwrap();
        fx.events
            .send(SessionEvent::UserTranscript {
                text: "Sure, go ahead.".to_string(),
                is_final: true,
                confidence: Some(0.9),
            })
            .unwrap();
        settle().await;

        let turns = fx.handler.transcript();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].speaker, Speaker::Agent);
        assert_eq!(turns[0].audio_chunk_id, Some(7));
        assert_eq!(turns[1].speaker, Speaker::Contact);
        assert_eq!(turns[1].message, "Sure, go ahead.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_with_queued_playback() {
        let fx = started(FakeLink::new()).await;
        let capture = fx.handler.capture_sender();
        capture.send(frame(640, 1)).await.unwrap();

        for chunk_id in 1..=3 {
            fx.events
                .send(SessionEvent::AudioChunk {
                    chunk_id,
                    audio: vec![chunk_id as u8; 32_000],
                    end_ms: None,
                })
                .unwrap();
        }
        settle().await;
        assert_eq!(fx.handler.queued_playback(), 2);

        let file = fx.handler.cleanup().await.unwrap().unwrap();
        assert!(file.path.exists());
        assert_eq!(fx.handler.queued_playback(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.sink.played().len(), 1);

        let again = fx.handler.cleanup().await.unwrap().unwrap();
        assert_eq!(again.path, file.path);
    }
}
