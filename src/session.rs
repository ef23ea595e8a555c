//! Realtime audio session manager
//!
//! A [`LiveSession`] is an actor: one tokio task that owns every piece of
//! per-session state and handles one [`Event`] at a time. Microphone frames,
//! transport traffic, playback completions and user commands all arrive on
//! the same queue, so nothing here needs a lock.
//!
//! Device acquisition and the transport handshake are the only slow steps.
//! They run in a separate task that posts the acquired resources back as an
//! `Opened` event. Each start bumps a generation counter and every sink is
//! tagged with it; stopping bumps it again, which turns any late event from
//! the old session into a no-op.

use crate::codec::{decode_pcm16, encode_pcm16};
use crate::config::LiveConfig;
use crate::devices::{CaptureDevice, CaptureError, PlaybackDevice, PlaybackError};
use crate::events::{Event, EventRx, EventTx, FrameSink, InboundSink, Resources, SegmentSink};
use crate::gemini::{ApiResponse, GeminiError};
use crate::recorder::SessionRecorder;
use crate::schedule::PlaybackScheduler;
use crate::transcript::{Speaker, TranscriptAssembler, TranscriptEntry};
use crate::transport::Connector;

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
}

/// User-visible session failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("No API key configured (set GEMINI_API_KEY)")]
    MissingApiKey,

    #[error("Microphone access denied: {0}")]
    Authorization(String),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Could not connect: {0}")]
    TransportOpen(String),

    #[error("Connection error: {0}")]
    Transport(String),

    #[error("Connection closed by server{}", reason_suffix(.0))]
    RemoteClosed(Option<String>),
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!(": {}", reason),
        None => String::new(),
    }
}

impl From<CaptureError> for SessionError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::PermissionDenied(msg) => SessionError::Authorization(msg),
            other => SessionError::Device(other.to_string()),
        }
    }
}

impl From<PlaybackError> for SessionError {
    fn from(e: PlaybackError) -> Self {
        SessionError::Device(e.to_string())
    }
}

impl From<GeminiError> for SessionError {
    fn from(e: GeminiError) -> Self {
        match e {
            GeminiError::MissingApiKey => SessionError::MissingApiKey,
            other => SessionError::TransportOpen(other.to_string()),
        }
    }
}

/// Updates pushed to whoever renders the session
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    State(SessionState),
    Error(SessionError),
    /// In-flight transcript text for one speaker
    Partial { speaker: Speaker, text: String },
    /// A finalized transcript entry
    Transcript(TranscriptEntry),
}

/// Point-in-time view of the session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub status: String,
    pub cursor: f64,
    pub pending_segments: usize,
    pub transcript: Vec<TranscriptEntry>,
    pub partial_user: String,
    pub partial_model: String,
    pub last_error: Option<SessionError>,
}

/// Shuts the actor down when the last [`SessionHandle`] goes away
struct HandleGuard {
    tx: EventTx,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Event::Shutdown);
    }
}

/// Cloneable command handle for a running [`LiveSession`]
///
/// Dropping every clone has the same effect as [`SessionHandle::shutdown`].
#[derive(Clone)]
pub struct SessionHandle {
    tx: EventTx,
    _guard: Arc<HandleGuard>,
}

impl SessionHandle {
    /// Request a new session. Ignored while one is connecting or active.
    pub fn start(&self) -> bool {
        self.tx.send(Event::Start).is_ok()
    }

    /// Request the current session to stop. Safe in any state.
    pub fn stop(&self) -> bool {
        self.tx.send(Event::Stop).is_ok()
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Event::Snapshot(reply)).ok()?;
        rx.await.ok()
    }

    /// Stop any session and end the actor task.
    pub fn shutdown(&self) -> bool {
        self.tx.send(Event::Shutdown).is_ok()
    }
}

/// Who ended the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    User,
    RemoteClosed,
    TransportError,
    DeviceError,
}

impl StopCause {
    /// Whether the transport is still usable and should be closed by us
    fn closes_transport(self) -> bool {
        matches!(self, StopCause::User | StopCause::DeviceError)
    }
}

pub struct LiveSession {
    config: Arc<LiveConfig>,
    connector: Arc<dyn Connector>,
    microphone: Arc<dyn CaptureDevice>,
    speaker: Arc<dyn PlaybackDevice>,
    tx: EventTx,
    notices: mpsc::UnboundedSender<Notice>,

    state: SessionState,
    generation: u64,
    active: Option<Resources>,
    scheduler: PlaybackScheduler,
    transcript: TranscriptAssembler,
    recorder: Option<SessionRecorder>,
    last_error: Option<SessionError>,
    /// Inbound traffic that arrived before the start finished
    early: Vec<ApiResponse>,
}

impl LiveSession {
    /// Spawn the session actor.
    ///
    /// Returns the command handle, the notice stream and the actor task.
    pub fn spawn(
        config: Arc<LiveConfig>,
        connector: Arc<dyn Connector>,
        microphone: Arc<dyn CaptureDevice>,
        speaker: Arc<dyn PlaybackDevice>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<Notice>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let session = Self {
            config,
            connector,
            microphone,
            speaker,
            tx: tx.clone(),
            notices: notice_tx,
            state: SessionState::Idle,
            generation: 0,
            active: None,
            scheduler: PlaybackScheduler::new(),
            transcript: TranscriptAssembler::new(),
            recorder: None,
            last_error: None,
            early: Vec::new(),
        };

        let task = tokio::spawn(session.run(rx));
        let handle = SessionHandle {
            tx: tx.clone(),
            _guard: Arc::new(HandleGuard { tx }),
        };
        (handle, notice_rx, task)
    }

    async fn run(mut self, mut rx: EventRx) {
        info!("Session manager started");
        while let Some(event) = rx.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        self.stop(StopCause::User);
        info!("Session manager stopped");
    }

    /// Process one event. Returns `false` when the actor should exit.
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Start => self.start(),
            Event::Stop => self.stop(StopCause::User),
            Event::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Event::Shutdown => return false,
            Event::Opened { generation, result } => self.on_opened(generation, result),
            Event::Frame { generation, pcm } => self.on_frame(generation, pcm),
            Event::Inbound {
                generation,
                response,
            } => self.on_inbound(generation, response),
            Event::TransportClosed { generation, reason } => {
                if generation == self.generation {
                    info!("Transport closed by remote: {:?}", reason);
                    self.fail(StopCause::RemoteClosed, SessionError::RemoteClosed(reason));
                }
            }
            Event::TransportFailed { generation, error } => {
                if generation == self.generation {
                    error!("Transport error: {}", error);
                    self.fail(StopCause::TransportError, SessionError::Transport(error));
                }
            }
            Event::SegmentFinished { generation, id } => {
                if generation == self.generation && self.scheduler.complete(id).is_some() {
                    debug!("Segment {} finished", id);
                }
            }
            Event::DeviceFailed { generation, error } => {
                if generation == self.generation && self.active.is_some() {
                    error!("Audio device failed: {}", error);
                    self.fail(StopCause::DeviceError, SessionError::Device(error));
                }
            }
        }
        true
    }

    fn start(&mut self) {
        if self.state != SessionState::Idle {
            debug!("Start ignored: session is {:?}", self.state);
            return;
        }
        if self.config.api_key.is_none() {
            warn!("Start refused: no API key configured");
            self.report(SessionError::MissingApiKey);
            return;
        }

        self.generation += 1;
        self.last_error = None;
        self.set_state(SessionState::Connecting);
        info!("Starting session (generation {})", self.generation);

        let generation = self.generation;
        let tx = self.tx.clone();
        let microphone = Arc::clone(&self.microphone);
        let speaker = Arc::clone(&self.speaker);
        let connector = Arc::clone(&self.connector);

        tokio::spawn(async move {
            let result = acquire(generation, &tx, microphone, speaker, connector).await;
            let _ = tx.send(Event::Opened { generation, result });
        });
    }

    fn on_opened(&mut self, generation: u64, result: Result<Resources, SessionError>) {
        if generation != self.generation {
            match result {
                Ok(resources) => {
                    info!("Releasing resources of an abandoned start");
                    release(resources, true);
                }
                Err(e) => debug!("Abandoned start failed anyway: {}", e),
            }
            return;
        }

        match result {
            Ok(mut resources) => {
                resources
                    .capture
                    .start(FrameSink::new(generation, self.tx.clone()));
                self.recorder = self.open_recorder();
                self.active = Some(resources);
                self.set_state(SessionState::Active);
                info!("Session active");

                let early = std::mem::take(&mut self.early);
                if !early.is_empty() {
                    debug!("Replaying {} early server messages", early.len());
                }
                for response in early {
                    self.on_inbound(generation, response);
                }
            }
            Err(e) => {
                self.early.clear();
                error!("Session start failed: {}", e);
                self.report(e);
                self.set_state(SessionState::Idle);
            }
        }
    }

    fn on_frame(&mut self, generation: u64, pcm: Vec<i16>) {
        if generation != self.generation {
            return;
        }
        let Some(resources) = self.active.as_mut() else {
            return;
        };

        if let Some(recorder) = self.recorder.as_mut() {
            recorder.write_input(&pcm);
        }
        let chunk = encode_pcm16(&pcm, self.config.input_sample_rate);
        if let Err(e) = resources.transport.send_audio(chunk) {
            debug!("Dropping audio frame: {}", e);
        }
    }

    fn on_inbound(&mut self, generation: u64, response: ApiResponse) {
        if generation != self.generation {
            return;
        }
        if self.active.is_none() {
            // The reader starts before the resources reach us
            if self.state == SessionState::Connecting {
                self.early.push(response);
            }
            return;
        }

        match response {
            ApiResponse::InputTranscription(text) => self.on_fragment(Speaker::User, &text),
            ApiResponse::OutputTranscription(text) => self.on_fragment(Speaker::Model, &text),
            ApiResponse::TurnComplete => self.on_turn_complete(),
            ApiResponse::Audio { data, mime_type } => self.on_audio(&data, mime_type.as_deref()),
            ApiResponse::Interrupted => self.on_interrupted(),
            ApiResponse::Text(text) => debug!("Model text: {}", text),
            ApiResponse::GoAway { time_left } => {
                warn!("Server will disconnect soon (time left: {:?})", time_left)
            }
            ApiResponse::SetupComplete => debug!("Duplicate setupComplete ignored"),
        }
    }

    fn on_fragment(&mut self, speaker: Speaker, fragment: &str) {
        let text = self.transcript.push(speaker, fragment).to_string();
        self.notify(Notice::Partial { speaker, text });
    }

    fn on_turn_complete(&mut self) {
        for entry in self.transcript.finish_turn() {
            debug!("{}: {}", entry.speaker, entry.text);
            if let Some(recorder) = self.recorder.as_mut() {
                recorder.write_entry(&entry);
            }
            self.notify(Notice::Transcript(entry));
        }
    }

    fn on_audio(&mut self, data: &str, mime_type: Option<&str>) {
        let buffer = match decode_pcm16(data, mime_type, self.config.output_sample_rate) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("Dropping undecodable audio payload: {}", e);
                return;
            }
        };
        let Some(resources) = self.active.as_mut() else {
            return;
        };

        let segment = self
            .scheduler
            .schedule(resources.output.now(), buffer.duration());
        debug!(
            "Scheduled {} at {:.3}s for {:.3}s",
            segment.id, segment.start, segment.duration
        );

        if let Some(recorder) = self.recorder.as_mut() {
            recorder.write_output(&buffer);
        }
        resources.output.schedule(segment.id, segment.start, buffer);
    }

    fn on_interrupted(&mut self) {
        info!("Model interrupted, flushing playback");
        if let Some(resources) = self.active.as_mut() {
            for segment in self.scheduler.drain() {
                resources.output.cancel(segment.id);
            }
        }
    }

    fn fail(&mut self, cause: StopCause, error: SessionError) {
        self.report(error);
        self.stop(cause);
    }

    /// Tear the session down. Idempotent.
    fn stop(&mut self, cause: StopCause) {
        if self.state == SessionState::Idle && self.active.is_none() {
            debug!("Stop ignored: no session");
            return;
        }
        info!("Stopping session ({:?})", cause);

        // Anything still in flight for this session is now stale
        self.generation += 1;

        if let Some(mut resources) = self.active.take() {
            if cause.closes_transport() {
                resources.transport.close();
            }
            resources.capture.disconnect();
            resources.capture.release();
            for segment in self.scheduler.drain() {
                resources.output.cancel(segment.id);
            }
            resources.output.close();
        }

        let leftover = self.scheduler.drain();
        if !leftover.is_empty() {
            warn!("{} segments pending without an output", leftover.len());
        }
        self.early.clear();
        self.transcript.discard_pending();
        if let Some(recorder) = self.recorder.take() {
            recorder.finish();
        }
        self.set_state(SessionState::Idle);
    }

    fn open_recorder(&self) -> Option<SessionRecorder> {
        let dir = self.config.record_dir.as_ref()?;
        match SessionRecorder::create(
            dir,
            self.config.input_sample_rate,
            self.config.output_sample_rate,
        ) {
            Ok(recorder) => Some(recorder),
            Err(e) => {
                warn!("Session recording disabled: {}", e);
                None
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            status: self.status_line(),
            cursor: self.scheduler.cursor(),
            pending_segments: self.scheduler.pending_len(),
            transcript: self.transcript.log().to_vec(),
            partial_user: self.transcript.pending(Speaker::User).to_string(),
            partial_model: self.transcript.pending(Speaker::Model).to_string(),
            last_error: self.last_error.clone(),
        }
    }

    fn status_line(&self) -> String {
        match (self.state, &self.last_error) {
            (SessionState::Connecting, _) => "Connecting...".to_string(),
            (SessionState::Active, _) => "Live: listening".to_string(),
            (SessionState::Idle, Some(e)) => format!("Error: {}", e),
            (SessionState::Idle, None) => "Idle".to_string(),
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            self.state = state;
            self.notify(Notice::State(state));
        }
    }

    fn report(&mut self, error: SessionError) {
        self.last_error = Some(error.clone());
        self.notify(Notice::Error(error));
    }

    fn notify(&self, notice: Notice) {
        // Nobody listening is fine
        let _ = self.notices.send(notice);
    }
}

/// Acquire microphone, output and transport, in that order.
///
/// On failure everything acquired so far is released before returning.
async fn acquire(
    generation: u64,
    tx: &EventTx,
    microphone: Arc<dyn CaptureDevice>,
    speaker: Arc<dyn PlaybackDevice>,
    connector: Arc<dyn Connector>,
) -> Result<Resources, SessionError> {
    let capture = microphone.acquire().await.map_err(|e| {
        warn!("Microphone acquisition failed: {}", e);
        SessionError::from(e)
    })?;

    let output = match speaker.open(SegmentSink::new(generation, tx.clone())).await {
        Ok(output) => output,
        Err(e) => {
            warn!("Playback device failed to open: {}", e);
            capture.release();
            return Err(e.into());
        }
    };

    let transport = match connector.open(InboundSink::new(generation, tx.clone())).await {
        Ok(transport) => transport,
        Err(e) => {
            warn!("Transport failed to open: {}", e);
            capture.release();
            output.close();
            return Err(e.into());
        }
    };

    Ok(Resources {
        capture,
        output,
        transport,
    })
}

fn release(mut resources: Resources, close_transport: bool) {
    if close_transport {
        resources.transport.close();
    }
    resources.capture.disconnect();
    resources.capture.release();
    resources.output.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AudioBuffer, EncodedChunk};
    use crate::devices::{CaptureStream, PlaybackOutput};
    use crate::schedule::SegmentId;
    use crate::transport::LiveTransport;
    use async_trait::async_trait;
    use base64::engine::general_purpose;
    use base64::Engine;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Probe {
        calls: Vec<String>,
        sent_chunks: usize,
        scheduled: Vec<(SegmentId, f64, f64)>,
        clock: f64,
        frames: Option<FrameSink>,
        inbound: Option<InboundSink>,
        finished: Option<SegmentSink>,
    }

    type Shared = Arc<Mutex<Probe>>;

    fn record(probe: &Shared, call: &str) {
        probe.lock().unwrap().calls.push(call.to_string());
    }

    struct FakeMic {
        probe: Shared,
        deny: bool,
    }

    #[async_trait]
    impl CaptureDevice for FakeMic {
        async fn acquire(&self) -> Result<Box<dyn CaptureStream>, CaptureError> {
            if self.deny {
                record(&self.probe, "mic.denied");
                return Err(CaptureError::PermissionDenied("blocked by user".to_string()));
            }
            record(&self.probe, "mic.acquire");
            Ok(Box::new(FakeCapture {
                probe: self.probe.clone(),
            }))
        }
    }

    struct FakeCapture {
        probe: Shared,
    }

    impl CaptureStream for FakeCapture {
        fn start(&mut self, sink: FrameSink) {
            let mut probe = self.probe.lock().unwrap();
            probe.calls.push("capture.start".to_string());
            probe.frames = Some(sink);
        }

        fn disconnect(&mut self) {
            let mut probe = self.probe.lock().unwrap();
            probe.calls.push("capture.disconnect".to_string());
            probe.frames = None;
        }

        fn release(self: Box<Self>) {
            record(&self.probe, "mic.release");
        }
    }

    struct FakeSpeaker {
        probe: Shared,
    }

    #[async_trait]
    impl PlaybackDevice for FakeSpeaker {
        async fn open(&self, done: SegmentSink) -> Result<Box<dyn PlaybackOutput>, PlaybackError> {
            let mut probe = self.probe.lock().unwrap();
            probe.calls.push("output.open".to_string());
            probe.finished = Some(done);
            Ok(Box::new(FakeOutput {
                probe: self.probe.clone(),
            }))
        }
    }

    struct FakeOutput {
        probe: Shared,
    }

    impl PlaybackOutput for FakeOutput {
        fn now(&self) -> f64 {
            self.probe.lock().unwrap().clock
        }

        fn schedule(&mut self, id: SegmentId, start: f64, buffer: AudioBuffer) {
            self.probe
                .lock()
                .unwrap()
                .scheduled
                .push((id, start, buffer.duration()));
        }

        fn cancel(&mut self, id: SegmentId) {
            record(&self.probe, &format!("output.cancel {}", id));
        }

        fn close(self: Box<Self>) {
            record(&self.probe, "output.close");
        }
    }

    struct FakeConnector {
        probe: Shared,
        fail: bool,
        gate: Option<Arc<Notify>>,
        /// Server messages that arrive while the connection is opening
        greeting: Vec<ApiResponse>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn open(
            &self,
            inbound: InboundSink,
        ) -> crate::gemini::Result<Box<dyn LiveTransport>> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                record(&self.probe, "transport.failed");
                return Err(GeminiError::Rejected("API key not valid".to_string()));
            }
            for response in &self.greeting {
                inbound.deliver(response.clone());
            }
            let mut probe = self.probe.lock().unwrap();
            probe.calls.push("transport.open".to_string());
            probe.inbound = Some(inbound);
            Ok(Box::new(FakeTransport {
                probe: self.probe.clone(),
                closed: false,
            }))
        }
    }

    struct FakeTransport {
        probe: Shared,
        closed: bool,
    }

    impl LiveTransport for FakeTransport {
        fn send_audio(&mut self, _chunk: EncodedChunk) -> crate::gemini::Result<()> {
            if self.closed {
                return Err(GeminiError::ConnectionClosed);
            }
            self.probe.lock().unwrap().sent_chunks += 1;
            Ok(())
        }

        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                record(&self.probe, "transport.close");
            }
        }
    }

    #[derive(Default)]
    struct Options {
        deny: bool,
        fail: bool,
        no_key: bool,
        gate: Option<Arc<Notify>>,
        greeting: Vec<ApiResponse>,
    }

    struct Harness {
        handle: SessionHandle,
        notices: mpsc::UnboundedReceiver<Notice>,
        probe: Shared,
        task: JoinHandle<()>,
    }

    fn harness(options: Options) -> Harness {
        let probe = Shared::default();
        let config = LiveConfig {
            api_key: if options.no_key {
                None
            } else {
                Some("test-key".to_string())
            },
            output_sample_rate: 1_000,
            ..Default::default()
        };

        let (handle, notices, task) = LiveSession::spawn(
            Arc::new(config),
            Arc::new(FakeConnector {
                probe: probe.clone(),
                fail: options.fail,
                gate: options.gate,
                greeting: options.greeting,
            }),
            Arc::new(FakeMic {
                probe: probe.clone(),
                deny: options.deny,
            }),
            Arc::new(FakeSpeaker {
                probe: probe.clone(),
            }),
        );

        Harness {
            handle,
            notices,
            probe,
            task,
        }
    }

    impl Harness {
        async fn next_notice(&mut self) -> Notice {
            tokio::time::timeout(Duration::from_secs(2), self.notices.recv())
                .await
                .expect("timed out waiting for a notice")
                .expect("notice channel closed")
        }

        async fn wait_for_state(&mut self, state: SessionState) {
            loop {
                if self.next_notice().await == Notice::State(state) {
                    return;
                }
            }
        }

        async fn start_active(&mut self) {
            assert!(self.handle.start());
            self.wait_for_state(SessionState::Active).await;
        }

        async fn snapshot(&self) -> SessionSnapshot {
            self.handle.snapshot().await.expect("session actor gone")
        }

        fn inbound(&self) -> InboundSink {
            self.probe
                .lock()
                .unwrap()
                .inbound
                .clone()
                .expect("transport was never opened")
        }

        fn calls(&self) -> Vec<String> {
            self.probe.lock().unwrap().calls.clone()
        }

        fn count(&self, call: &str) -> usize {
            self.calls().iter().filter(|c| c.as_str() == call).count()
        }
    }

    fn audio_payload(seconds: f64, rate: u32) -> ApiResponse {
        let samples = (seconds * rate as f64).round() as usize;
        ApiResponse::Audio {
            data: general_purpose::STANDARD.encode(vec![0u8; samples * 2]),
            mime_type: Some(format!("audio/pcm;rate={}", rate)),
        }
    }

    #[tokio::test]
    async fn test_start_acquires_in_order() {
        let mut h = harness(Options::default());
        assert!(h.handle.start());
        assert_eq!(h.next_notice().await, Notice::State(SessionState::Connecting));
        assert_eq!(h.next_notice().await, Notice::State(SessionState::Active));

        assert_eq!(
            h.calls(),
            vec!["mic.acquire", "output.open", "transport.open", "capture.start"]
        );
        let snapshot = h.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Active);
        assert_eq!(snapshot.status, "Live: listening");
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn test_transcript_turn_scenario() {
        let mut h = harness(Options::default());
        h.start_active().await;

        let inbound = h.inbound();
        inbound.deliver(ApiResponse::InputTranscription("Hello".to_string()));
        inbound.deliver(ApiResponse::OutputTranscription(" world".to_string()));

        let partial = h.snapshot().await;
        assert_eq!(partial.partial_user, "Hello");
        assert_eq!(partial.partial_model, " world");
        assert!(partial.transcript.is_empty());

        inbound.deliver(ApiResponse::TurnComplete);
        let snapshot = h.snapshot().await;
        assert_eq!(
            snapshot.transcript,
            vec![
                TranscriptEntry::new(Speaker::User, "Hello"),
                TranscriptEntry::new(Speaker::Model, " world"),
            ]
        );
        assert!(snapshot.partial_user.is_empty());

        let mut finalized = Vec::new();
        while let Ok(notice) = h.notices.try_recv() {
            if let Notice::Transcript(entry) = notice {
                finalized.push(entry.speaker);
            }
        }
        assert_eq!(finalized, vec![Speaker::User, Speaker::Model]);
    }

    #[tokio::test]
    async fn test_turn_complete_with_one_side() {
        let mut h = harness(Options::default());
        h.start_active().await;
        let inbound = h.inbound();

        inbound.deliver(ApiResponse::OutputTranscription("Sure.".to_string()));
        inbound.deliver(ApiResponse::TurnComplete);
        inbound.deliver(ApiResponse::TurnComplete);

        let snapshot = h.snapshot().await;
        assert_eq!(
            snapshot.transcript,
            vec![TranscriptEntry::new(Speaker::Model, "Sure.")]
        );
    }

    #[tokio::test]
    async fn test_audio_payloads_play_back_to_back() {
        let mut h = harness(Options::default());
        h.start_active().await;

        let inbound = h.inbound();
        inbound.deliver(audio_payload(2.0, 1_000));
        inbound.deliver(audio_payload(1.5, 1_000));

        let snapshot = h.snapshot().await;
        assert_eq!(snapshot.pending_segments, 2);
        assert!((snapshot.cursor - 3.5).abs() < 1e-9);

        let scheduled = h.probe.lock().unwrap().scheduled.clone();
        let starts: Vec<f64> = scheduled.iter().map(|(_, start, _)| *start).collect();
        assert_eq!(starts, vec![0.0, 2.0]);
    }

    #[tokio::test]
    async fn test_late_payload_starts_at_output_clock() {
        let mut h = harness(Options::default());
        h.start_active().await;

        let inbound = h.inbound();
        inbound.deliver(audio_payload(1.0, 1_000));
        h.snapshot().await;

        h.probe.lock().unwrap().clock = 5.0;
        inbound.deliver(audio_payload(0.5, 1_000));

        let snapshot = h.snapshot().await;
        assert!((snapshot.cursor - 5.5).abs() < 1e-9);
        let scheduled = h.probe.lock().unwrap().scheduled.clone();
        assert_eq!(scheduled[1].1, 5.0);
    }

    #[tokio::test]
    async fn test_finished_segments_leave_the_pending_set() {
        let mut h = harness(Options::default());
        h.start_active().await;

        h.inbound().deliver(audio_payload(0.25, 1_000));
        assert_eq!(h.snapshot().await.pending_segments, 1);

        let (id, sink) = {
            let probe = h.probe.lock().unwrap();
            (probe.scheduled[0].0, probe.finished.clone().unwrap())
        };
        assert!(sink.finished(id));
        // Unknown or repeated completions are harmless
        sink.finished(id);

        let snapshot = h.snapshot().await;
        assert_eq!(snapshot.pending_segments, 0);
        assert!((snapshot.cursor - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dropped() {
        let mut h = harness(Options::default());
        h.start_active().await;

        let inbound = h.inbound();
        inbound.deliver(ApiResponse::Audio {
            data: "%%% not audio %%%".to_string(),
            mime_type: Some("audio/pcm;rate=24000".to_string()),
        });
        inbound.deliver(audio_payload(0.5, 1_000));

        let snapshot = h.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Active);
        assert_eq!(snapshot.pending_segments, 1);
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn test_interruption_flushes_playback() {
        let mut h = harness(Options::default());
        h.start_active().await;

        let inbound = h.inbound();
        inbound.deliver(audio_payload(1.0, 1_000));
        inbound.deliver(audio_payload(1.0, 1_000));
        inbound.deliver(ApiResponse::Interrupted);

        let snapshot = h.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Active);
        assert_eq!(snapshot.pending_segments, 0);
        assert_eq!(snapshot.cursor, 0.0);
        assert_eq!(h.count("output.cancel seg#0"), 1);
        assert_eq!(h.count("output.cancel seg#1"), 1);
    }

    #[tokio::test]
    async fn test_frames_are_forwarded_while_active() {
        let mut h = harness(Options::default());
        h.start_active().await;

        let frames = h.probe.lock().unwrap().frames.clone().unwrap();
        assert!(frames.push(vec![0; 320]));
        assert!(frames.push(vec![1; 320]));
        h.snapshot().await;
        assert_eq!(h.probe.lock().unwrap().sent_chunks, 2);

        h.handle.stop();
        h.wait_for_state(SessionState::Idle).await;

        // A frame that was already in flight when the session stopped
        frames.push(vec![2; 320]);
        h.snapshot().await;
        assert_eq!(h.probe.lock().unwrap().sent_chunks, 2);
    }

    #[tokio::test]
    async fn test_user_stop_releases_everything_once() {
        let mut h = harness(Options::default());
        h.start_active().await;

        let inbound = h.inbound();
        inbound.deliver(audio_payload(2.0, 1_000));
        inbound.deliver(audio_payload(1.5, 1_000));
        inbound.deliver(ApiResponse::InputTranscription("half a sen".to_string()));
        h.snapshot().await;

        h.handle.stop();
        h.wait_for_state(SessionState::Idle).await;

        let calls = h.calls();
        let teardown: Vec<&str> = calls
            .iter()
            .skip_while(|c| c.as_str() != "capture.start")
            .skip(1)
            .map(|c| c.as_str())
            .collect();
        assert_eq!(
            teardown,
            vec![
                "transport.close",
                "capture.disconnect",
                "mic.release",
                "output.cancel seg#0",
                "output.cancel seg#1",
                "output.close",
            ]
        );

        let snapshot = h.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.pending_segments, 0);
        assert_eq!(snapshot.cursor, 0.0);
        assert!(snapshot.partial_user.is_empty());
        assert!(snapshot.last_error.is_none());
        assert_eq!(snapshot.status, "Idle");

        h.handle.stop();
        let again = h.snapshot().await;
        assert_eq!(again.state, SessionState::Idle);
        assert_eq!(h.calls(), calls);
        assert!(h.notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_a_no_op() {
        let mut h = harness(Options::default());
        h.handle.stop();
        h.handle.stop();

        let snapshot = h.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Idle);
        assert!(h.calls().is_empty());
        assert!(h.notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_permission_denied_stays_idle() {
        let mut h = harness(Options {
            deny: true,
            ..Default::default()
        });
        h.handle.start();

        assert_eq!(h.next_notice().await, Notice::State(SessionState::Connecting));
        match h.next_notice().await {
            Notice::Error(SessionError::Authorization(msg)) => assert_eq!(msg, "blocked by user"),
            other => panic!("Unexpected notice: {:?}", other),
        }
        assert_eq!(h.next_notice().await, Notice::State(SessionState::Idle));

        assert_eq!(h.calls(), vec!["mic.denied"]);
        let snapshot = h.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Idle);
        assert!(snapshot.status.starts_with("Error: Microphone access denied"));
        assert!(h.probe.lock().unwrap().inbound.is_none());
        assert!(h.probe.lock().unwrap().frames.is_none());
    }

    #[tokio::test]
    async fn test_transport_open_failure_releases_devices() {
        let mut h = harness(Options {
            fail: true,
            ..Default::default()
        });
        h.handle.start();
        h.wait_for_state(SessionState::Idle).await;

        assert_eq!(
            h.calls(),
            vec![
                "mic.acquire",
                "output.open",
                "transport.failed",
                "mic.release",
                "output.close",
            ]
        );
        let snapshot = h.snapshot().await;
        assert!(matches!(
            snapshot.last_error,
            Some(SessionError::TransportOpen(ref msg)) if msg.contains("API key not valid")
        ));
    }

    #[tokio::test]
    async fn test_missing_api_key_refuses_to_start() {
        let mut h = harness(Options {
            no_key: true,
            ..Default::default()
        });
        h.handle.start();

        assert_eq!(h.next_notice().await, Notice::Error(SessionError::MissingApiKey));
        let snapshot = h.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Idle);
        assert!(h.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_while_active_is_ignored() {
        let mut h = harness(Options::default());
        h.start_active().await;
        h.handle.start();
        h.handle.start();

        let snapshot = h.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Active);
        assert_eq!(h.count("mic.acquire"), 1);
        assert_eq!(h.count("transport.open"), 1);
    }

    #[tokio::test]
    async fn test_remote_close_does_not_close_transport_again() {
        let mut h = harness(Options::default());
        h.start_active().await;
        h.inbound().deliver(audio_payload(1.0, 1_000));

        h.inbound().closed(Some("session expired".to_string()));
        h.wait_for_state(SessionState::Idle).await;

        assert_eq!(h.count("transport.close"), 0);
        assert_eq!(h.count("mic.release"), 1);
        assert_eq!(h.count("output.close"), 1);

        let snapshot = h.snapshot().await;
        assert_eq!(
            snapshot.last_error,
            Some(SessionError::RemoteClosed(Some("session expired".to_string())))
        );
        assert_eq!(snapshot.status, "Error: Connection closed by server: session expired");
        assert_eq!(snapshot.pending_segments, 0);
    }

    #[tokio::test]
    async fn test_transport_error_stops_session() {
        let mut h = harness(Options::default());
        h.start_active().await;

        h.inbound().failed("connection reset");
        h.wait_for_state(SessionState::Idle).await;

        assert_eq!(h.count("transport.close"), 0);
        assert_eq!(h.count("capture.disconnect"), 1);
        let snapshot = h.snapshot().await;
        assert_eq!(
            snapshot.last_error,
            Some(SessionError::Transport("connection reset".to_string()))
        );

        // The user can start over
        h.start_active().await;
        assert_eq!(h.count("mic.acquire"), 2);
        assert!(h.snapshot().await.last_error.is_none());
    }

    #[tokio::test]
    async fn test_stop_while_connecting_releases_late_resources() {
        let gate = Arc::new(Notify::new());
        let mut h = harness(Options {
            gate: Some(gate.clone()),
            ..Default::default()
        });

        h.handle.start();
        h.wait_for_state(SessionState::Connecting).await;
        h.handle.stop();
        h.wait_for_state(SessionState::Idle).await;

        gate.notify_one();
        for _ in 0..200 {
            if h.count("output.close") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(h.count("transport.close"), 1);
        assert_eq!(h.count("mic.release"), 1);
        assert_eq!(h.count("output.close"), 1);
        assert_eq!(h.count("capture.start"), 0);

        let snapshot = h.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Idle);
        assert!(h.notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_ends_actor_and_releases() {
        let mut h = harness(Options::default());
        h.start_active().await;

        h.handle.shutdown();
        tokio::time::timeout(Duration::from_secs(2), &mut h.task)
            .await
            .expect("actor did not exit")
            .unwrap();

        assert_eq!(h.count("transport.close"), 1);
        assert_eq!(h.count("mic.release"), 1);
        assert!(h.handle.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_every_handle_ends_the_session() {
        let mut h = harness(Options::default());
        h.start_active().await;

        let Harness {
            handle,
            notices,
            probe,
            task,
        } = h;
        let spare = handle.clone();
        drop(handle);
        drop(notices);
        drop(spare);

        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("actor outlived its handles")
            .unwrap();

        let calls = probe.lock().unwrap().calls.clone();
        let count = |call: &str| calls.iter().filter(|c| c.as_str() == call).count();
        assert_eq!(count("transport.close"), 1);
        assert_eq!(count("mic.release"), 1);
        assert_eq!(count("output.close"), 1);
    }

    #[tokio::test]
    async fn test_greeting_sent_while_connecting_is_kept() {
        let mut h = harness(Options {
            greeting: vec![
                ApiResponse::OutputTranscription("Hi, how can I help?".to_string()),
                audio_payload(0.5, 1_000),
            ],
            ..Default::default()
        });
        h.start_active().await;
        h.inbound().deliver(ApiResponse::TurnComplete);

        let snapshot = h.snapshot().await;
        assert_eq!(
            snapshot.transcript,
            vec![TranscriptEntry::new(Speaker::Model, "Hi, how can I help?")]
        );
        assert_eq!(snapshot.pending_segments, 1);
        assert!((snapshot.cursor - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_greeting_is_dropped_when_start_is_abandoned() {
        let gate = Arc::new(Notify::new());
        let mut h = harness(Options {
            gate: Some(gate.clone()),
            greeting: vec![ApiResponse::OutputTranscription("Hello?".to_string())],
            ..Default::default()
        });

        h.handle.start();
        h.wait_for_state(SessionState::Connecting).await;
        h.handle.stop();
        h.wait_for_state(SessionState::Idle).await;
        gate.notify_one();

        for _ in 0..200 {
            if h.count("output.close") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let snapshot = h.snapshot().await;
        assert!(snapshot.partial_model.is_empty());
        assert!(snapshot.transcript.is_empty());
    }

    #[tokio::test]
    async fn test_microphone_failure_ends_session() {
        let mut h = harness(Options::default());
        h.start_active().await;
        h.inbound().deliver(audio_payload(1.0, 1_000));

        let frames = h.probe.lock().unwrap().frames.clone().unwrap();
        frames.failed("microphone read failed: Input/Output error");
        h.wait_for_state(SessionState::Idle).await;

        assert_eq!(h.count("transport.close"), 1);
        assert_eq!(h.count("mic.release"), 1);
        assert_eq!(h.count("output.cancel seg#0"), 1);
        assert_eq!(h.count("output.close"), 1);

        let snapshot = h.snapshot().await;
        assert_eq!(
            snapshot.last_error,
            Some(SessionError::Device(
                "microphone read failed: Input/Output error".to_string()
            ))
        );
        assert_eq!(snapshot.pending_segments, 0);
        assert!(snapshot.status.starts_with("Error: Audio device error"));
    }

    #[tokio::test]
    async fn test_output_failure_ends_session() {
        let mut h = harness(Options::default());
        h.start_active().await;

        let finished = h.probe.lock().unwrap().finished.clone().unwrap();
        finished.failed("speaker write failed");
        h.wait_for_state(SessionState::Idle).await;

        assert_eq!(h.count("transport.close"), 1);
        assert_eq!(h.count("output.close"), 1);

        // A second report from the dead thread changes nothing
        finished.failed("speaker write failed");
        let snapshot = h.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(h.count("output.close"), 1);
        assert!(h.notices.try_recv().is_err());
    }
}
