//! Test doubles: an in-process call WebSocket server, a one-shot HTTP server,
//! and fakes for the backend, microphone, recognizer, speaker and transcriber.

use crate::api::{CallBackend, SessionInfo, SessionStatus};
use crate::bridge::{AudioSink, PlaybackCompletion, Transcriber};
use crate::capture::{FrameSender, MicrophoneSource};
use crate::codec::PlayableAudio;
use crate::error::CallError;
use crate::protocol::IncomingMessage;
use crate::recognizer::{ResultSender, SpeechRecognizer};
use crate::turn::PlaybackId;
use crate::vad::RecognizerEvent;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{accept_async, accept_hdr_async};
use tungstenite::handshake::server::{Request, Response};
use tungstenite::protocol::Message;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds, failing the test after a few seconds
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =========================================================================
// Call WebSocket server
// =========================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected { path: String },
    Received(serde_json::Value),
    Disconnected,
}

enum ServerCommand {
    Send(String),
    Drop,
    Close,
}

type CommandSlot = Arc<Mutex<Option<mpsc::UnboundedSender<ServerCommand>>>>;

pub struct MockCallServer {
    addr: SocketAddr,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    current: CommandSlot,
    // Keeps silent connections open
    _held: Arc<Mutex<Vec<TcpStream>>>,
}

impl MockCallServer {
    /// A server that accepts WebSocket connections one after another
    pub async fn start() -> Self {
        let (listener, addr) = bind().await;
        let (events_tx, events) = mpsc::unbounded_channel();
        let current: CommandSlot = Arc::new(Mutex::new(None));

        let slot = current.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                serve_connection(stream, events_tx.clone(), slot.clone()).await;
            }
        });

        Self {
            addr,
            events,
            current,
            _held: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Accepts TCP but never answers the WebSocket handshake
    pub async fn silent() -> Self {
        let (listener, addr) = bind().await;
        let held = Arc::new(Mutex::new(Vec::new()));
        let keep = held.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                keep.lock().unwrap().push(stream);
            }
        });
        let (_tx, events) = mpsc::unbounded_channel();
        Self {
            addr,
            events,
            current: Arc::new(Mutex::new(None)),
            _held: held,
        }
    }

    /// Accepts TCP and hangs up before the handshake
    pub async fn hang_up_on_accept() -> Self {
        let (listener, addr) = bind().await;
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
        let (_tx, events) = mpsc::unbounded_channel();
        Self {
            addr,
            events,
            current: Arc::new(Mutex::new(None)),
            _held: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Completes the WebSocket handshake, then drops the socket without a close frame
    pub async fn drop_after_handshake() -> Self {
        let (listener, addr) = bind().await;
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(ws) = accept_async(stream).await {
                        drop(ws);
                    }
                });
            }
        });
        let (_tx, events) = mpsc::unbounded_channel();
        Self {
            addr,
            events,
            current: Arc::new(Mutex::new(None)),
            _held: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// An origin nothing listens on
    pub async fn unused_origin() -> String {
        let (listener, addr) = bind().await;
        drop(listener);
        format!("http://{}", addr)
    }

    pub fn origin(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn next_event(&mut self) -> ServerEvent {
        match tokio::time::timeout(EVENT_TIMEOUT, self.events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => panic!("mock server stopped"),
            Err(_) => panic!("no server event within {:?}", EVENT_TIMEOUT),
        }
    }

    /// Next event, or `None` if nothing happens within `wait`
    pub async fn next_event_within(&mut self, wait: Duration) -> Option<ServerEvent> {
        tokio::time::timeout(wait, self.events.recv()).await.ok().flatten()
    }

    /// Skip events until a client message of the given type arrives
    pub async fn expect_message(&mut self, kind: &str) -> serde_json::Value {
        loop {
            if let ServerEvent::Received(value) = self.next_event().await {
                if value["type"] == kind {
                    return value;
                }
            }
        }
    }

    pub fn send(&self, message: &IncomingMessage) {
        let text = serde_json::to_string(message).unwrap();
        self.command(ServerCommand::Send(text));
    }

    pub fn send_raw(&self, text: &str) {
        self.command(ServerCommand::Send(text.to_string()));
    }

    /// Drop the TCP connection without a close frame
    pub fn drop_connection(&self) {
        self.command(ServerCommand::Drop);
    }

    /// Close the connection with a close frame
    pub fn close_connection(&self) {
        self.command(ServerCommand::Close);
    }

    fn command(&self, command: ServerCommand) {
        let slot = self.current.lock().unwrap();
        let tx = slot.as_ref().expect("no client connected");
        tx.send(command).expect("connection handler gone");
    }
}

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn serve_connection(
    stream: TcpStream,
    events: mpsc::UnboundedSender<ServerEvent>,
    slot: CommandSlot,
) {
    let mut path = String::new();
    let ws = accept_hdr_async(stream, |request: &Request, response: Response| {
        path = request.uri().path().to_string();
        Ok(response)
    })
    .await;
    let mut ws = match ws {
        Ok(ws) => ws,
        Err(_) => return,
    };

    let (tx, mut commands) = mpsc::unbounded_channel();
    *slot.lock().unwrap() = Some(tx);
    let _ = events.send(ServerEvent::Connected { path });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let value = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
                        let _ = events.send(ServerEvent::Received(value));
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        let _ = events.send(ServerEvent::Disconnected);
                        return;
                    }
                    Some(Ok(_)) => {}
                },
                command = commands.recv() => match command {
                    Some(ServerCommand::Send(text)) => {
                        let _ = ws.send(Message::Text(text)).await;
                    }
                    Some(ServerCommand::Close) => {
                        let _ = ws.close(None).await;
                    }
                    Some(ServerCommand::Drop) | None => {
                        let _ = events.send(ServerEvent::Disconnected);
                        return;
                    }
                },
            }
        }
    });
}

// =========================================================================
// One-shot HTTP server
// =========================================================================

/// What the one-shot HTTP server saw
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub struct MockHttpServer {
    addr: SocketAddr,
    request: oneshot::Receiver<RecordedRequest>,
}

impl MockHttpServer {
    /// Answer exactly one request with `status` and `body`
    pub async fn respond_once(status: u16, body: &str) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let (tx, request) = oneshot::channel();
        let body = body.to_string();

        std::thread::spawn(move || {
            let request = match server.recv() {
                Ok(request) => request,
                Err(_) => return,
            };
            let recorded = RecordedRequest {
                method: request.method().to_string(),
                url: request.url().to_string(),
                headers: request
                    .headers()
                    .iter()
                    .map(|h| (h.field.to_string(), h.value.to_string()))
                    .collect(),
            };

            let response = tiny_http::Response::from_string(body)
                .with_status_code(status)
                .with_header(
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
                );
            let _ = request.respond(response);
            let _ = tx.send(recorded);
        });

        Self { addr, request }
    }

    pub fn origin(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn request(self) -> RecordedRequest {
        tokio::time::timeout(EVENT_TIMEOUT, self.request).await.unwrap().unwrap()
    }
}

// =========================================================================
// Backend
// =========================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    StartSession(Option<String>),
    EndSession(String),
    LogUsage(String, u64),
    Status(String),
}

#[derive(Clone)]
pub struct FakeBackend {
    session_id: String,
    fail_usage: bool,
    calls: Arc<Mutex<Vec<BackendCall>>>,
}

impl FakeBackend {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            fail_usage: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_usage(mut self) -> Self {
        self.fail_usage = true;
        self
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn end_session_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, BackendCall::EndSession(_)))
            .count()
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl CallBackend for FakeBackend {
    async fn start_session(&self, character_id: Option<&str>) -> Result<SessionInfo, CallError> {
        self.record(BackendCall::StartSession(character_id.map(str::to_string)));
        Ok(SessionInfo {
            session_id: self.session_id.clone(),
            voice_id: Some("voice-1".to_string()),
            persona: None,
            websocket_url: None,
            status: Some("active".to_string()),
        })
    }

    async fn end_session(&self, session_id: &str) -> Result<(), CallError> {
        self.record(BackendCall::EndSession(session_id.to_string()));
        Ok(())
    }

    async fn log_usage(&self, character_id: &str, duration_seconds: u64) -> Result<(), CallError> {
        self.record(BackendCall::LogUsage(character_id.to_string(), duration_seconds));
        if self.fail_usage {
            return Err(CallError::Api("usage endpoint unavailable".to_string()));
        }
        Ok(())
    }

    async fn session_status(&self, session_id: &str) -> Result<SessionStatus, CallError> {
        self.record(BackendCall::Status(session_id.to_string()));
        Ok(SessionStatus {
            session_id: session_id.to_string(),
            status: "active".to_string(),
            persona: None,
            started_at: None,
            conversation: Vec::new(),
        })
    }
}

// =========================================================================
// Microphone
// =========================================================================

#[derive(Default)]
struct MicState {
    sender: Option<FrameSender>,
    starts: usize,
    deny: bool,
}

/// Scripted microphone; frames are pushed from the test through `MicControl`
pub struct FakeMicrophone {
    state: Arc<Mutex<MicState>>,
}

#[derive(Clone)]
pub struct MicControl {
    state: Arc<Mutex<MicState>>,
}

impl FakeMicrophone {
    pub fn new() -> (Self, MicControl) {
        let state = Arc::new(Mutex::new(MicState::default()));
        (
            Self { state: state.clone() },
            MicControl { state },
        )
    }

    pub fn denied() -> (Self, MicControl) {
        let (mic, control) = Self::new();
        control.state.lock().unwrap().deny = true;
        (mic, control)
    }
}

impl MicrophoneSource for FakeMicrophone {
    fn start(&mut self, frames: FrameSender) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        if state.deny {
            return Err(CallError::MicrophoneDenied("NotAllowedError".to_string()));
        }
        state.starts += 1;
        state.sender = Some(frames);
        Ok(())
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().sender = None;
    }

    fn is_running(&self) -> bool {
        self.state.lock().unwrap().sender.is_some()
    }
}

impl MicControl {
    /// Deliver one frame if the microphone is running
    pub fn push(&self, samples: &[f32]) -> bool {
        let sender = self.state.lock().unwrap().sender.clone();
        match sender {
            Some(sender) => sender.send(samples.to_vec()),
            None => false,
        }
    }

    /// Deliver `ms` worth of 512-sample frames at 16kHz with constant RMS `amplitude`
    pub fn push_tone(&self, amplitude: f32, ms: u64) -> usize {
        let frame: Vec<f32> = (0..512)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect();
        let count = (16 * ms as usize + 511) / 512;
        (0..count).filter(|_| self.push(&frame)).count()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().sender.is_some()
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }
}

// =========================================================================
// Speech recognizer
// =========================================================================

#[derive(Default)]
struct RecognizerState {
    results: Option<ResultSender>,
    starts: usize,
}

/// Scripted recognizer; results are pushed from the test through `RecognizerControl`
pub struct FakeRecognizer {
    state: Arc<Mutex<RecognizerState>>,
}

#[derive(Clone)]
pub struct RecognizerControl {
    state: Arc<Mutex<RecognizerState>>,
}

impl FakeRecognizer {
    pub fn new() -> (Self, RecognizerControl) {
        let state = Arc::new(Mutex::new(RecognizerState::default()));
        (Self { state: state.clone() }, RecognizerControl { state })
    }
}

impl SpeechRecognizer for FakeRecognizer {
    fn start(&mut self, results: ResultSender) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        state.starts += 1;
        state.results = Some(results);
        Ok(())
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().results = None;
    }

    fn is_running(&self) -> bool {
        self.state.lock().unwrap().results.is_some()
    }
}

impl RecognizerControl {
    /// Deliver one result if the recognizer is running
    pub fn push(&self, event: RecognizerEvent) -> bool {
        let results = self.state.lock().unwrap().results.clone();
        match results {
            Some(results) => results.send(event),
            None => false,
        }
    }

    /// The sender of the current run, kept past a restart
    pub fn sender(&self) -> Option<ResultSender> {
        self.state.lock().unwrap().results.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().results.is_some()
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }
}

// =========================================================================
// Speaker
// =========================================================================

#[derive(Default)]
struct SinkState {
    played: Vec<PlaybackId>,
    pending: VecDeque<PlaybackCompletion>,
    stops: usize,
}

/// Playback never ends on its own; the test finishes it through `SinkControl`
pub struct FakeSink {
    state: Arc<Mutex<SinkState>>,
}

#[derive(Clone)]
pub struct SinkControl {
    state: Arc<Mutex<SinkState>>,
}

impl FakeSink {
    pub fn new() -> (Self, SinkControl) {
        let state = Arc::new(Mutex::new(SinkState::default()));
        (Self { state: state.clone() }, SinkControl { state })
    }
}

impl AudioSink for FakeSink {
    fn play(&mut self, _audio: PlayableAudio, done: PlaybackCompletion) {
        let mut state = self.state.lock().unwrap();
        state.played.push(done.id());
        state.pending.push_back(done);
    }

    fn stop(&mut self) {
        let pending: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.stops += 1;
            state.pending.drain(..).collect()
        };
        // Dropped completions report failure
        drop(pending);
    }
}

impl SinkControl {
    pub fn played(&self) -> Vec<PlaybackId> {
        self.state.lock().unwrap().played.clone()
    }

    pub fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    /// Simulate the `ended` (or error) event of the oldest playing audio
    pub fn finish(&self, result: Result<(), CallError>) -> Option<PlaybackId> {
        let done = self.state.lock().unwrap().pending.pop_front()?;
        let id = done.id();
        done.complete(result);
        Some(id)
    }
}

// =========================================================================
// Transcriber
// =========================================================================

#[derive(Default)]
struct TranscriberState {
    script: VecDeque<Result<String, CallError>>,
    calls: Vec<usize>,
}

/// Returns scripted results, `"transcribed"` once the script runs out
#[derive(Clone, Default)]
pub struct FakeTranscriber {
    state: Arc<Mutex<TranscriberState>>,
    delay: Duration,
}

impl FakeTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then(self, result: Result<String, CallError>) -> Self {
        self.state.lock().unwrap().script.push_back(result);
        self
    }

    /// Sample counts of every transcription request
    pub fn calls(&self) -> Vec<usize> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, samples: Vec<f32>, _sample_rate: u32) -> Result<String, CallError> {
        let scripted = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(samples.len());
            state.script.pop_front()
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        scripted.unwrap_or_else(|| Ok("transcribed".to_string()))
    }
}
