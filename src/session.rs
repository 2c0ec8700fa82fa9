//! Call session and engine
//!
//! `start_call` creates the backend session, opens the transport and spawns the
//! engine: one tokio task that owns the turn controller, the voice pipeline,
//! the microphone and the speaker. Everything that can happen during a call
//! (inbound messages, microphone frames, recognizer results, transcriptions,
//! playback completions, user commands) arrives as an `EngineEvent` on one
//! channel and is handled to completion before the next one, so an inbound AI-audio message
//! preempts capture before any later frame is looked at.

use crate::api::CallBackend;
use crate::bridge::{
    decode_inline, fetch_audio, prepare_outbound, resolve_audio_source, transcript_message, AudioSink,
    AudioSource, Outbound, PlaybackCompletion, PlaybackResult, Transcriber,
};
use crate::bus::Topic;
use crate::capture::{AudioFrame, CaptureEpoch, CaptureLease, CaptureManager, FrameSender, MicrophoneSource};
use crate::codec::PlayableAudio;
use crate::config::{CallSettings, CaptureStrategy, OutboundAudio};
use crate::error::CallError;
use crate::protocol::{IncomingMessage, MessageKind, OutgoingMessage};
use crate::recognizer::{RecognizedEvent, ResultSender, SpeechRecognizer};
use crate::transport::{ConnectionState, ReconnectPolicy, SessionTransport};
use crate::turn::{PlaybackId, PlaybackOutcome, Transition, TurnController, TurnState};
use crate::vad::{Utterance, UtteranceId, VoicePipeline};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};

/// How long queued outbound frames may take to flush when the call ends
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Subscribed message kinds the engine acts on
const ENGINE_KINDS: [MessageKind; 7] = [
    MessageKind::SessionStarted,
    MessageKind::ListeningStarted,
    MessageKind::ListeningStopped,
    MessageKind::Transcription,
    MessageKind::AiResponseText,
    MessageKind::AiResponseAudio,
    MessageKind::Error,
];

/// Render elapsed call time as `MM:SS`
pub fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// The persona being called
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacterRef {
    pub id: Option<String>,
    pub name: Option<String>,
}

/// One ongoing call; immutable once created
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSession {
    pub session_id: String,
    pub character_id: Option<String>,
    pub character_name: Option<String>,
    pub voice_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    pub fn elapsed_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}

/// What a UI needs to render the call screen
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub connection: ConnectionState,
    pub turn: TurnState,
    pub muted: bool,
    pub elapsed_secs: u64,
    pub last_ai_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Ai,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum EndReason {
    /// The user hung up
    UserEnded,
    /// The server closed the connection cleanly
    RemoteHangup,
    /// A fatal failure ended the call
    Failed(CallError),
}

impl EndReason {
    /// Text for the blocking alert, only for failures
    pub fn user_message(&self) -> Option<String> {
        match self {
            EndReason::Failed(e) => Some(e.user_message()),
            _ => None,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::UserEnded => f.write_str("ended by user"),
            EndReason::RemoteHangup => f.write_str("ended by server"),
            EndReason::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

#[derive(Debug)]
pub struct CallSummary {
    pub session: CallSession,
    pub duration_secs: u64,
    pub reason: EndReason,
    pub conversation: Vec<ConversationTurn>,
}

impl CallSummary {
    pub fn formatted_duration(&self) -> String {
        format_duration(self.duration_secs)
    }
}

/// Collaborators of a call
pub struct CallDeps {
    pub backend: Arc<dyn CallBackend>,
    pub microphone: Box<dyn MicrophoneSource>,
    /// Required for `capture_strategy = "recognizer"`
    pub recognizer: Option<Box<dyn SpeechRecognizer>>,
    pub sink: Box<dyn AudioSink>,
    /// Required for `outbound_audio = "transcribe"`
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub capture: CaptureManager,
    /// Used to fetch AI audio given by URL
    pub http: reqwest::Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    EndCall,
    SetMuted(bool),
    FinishUtterance,
}

enum EngineEvent {
    Inbound(IncomingMessage),
    Frame(AudioFrame),
    Recognized(RecognizedEvent),
    Transcribed {
        utterance: UtteranceId,
        result: Result<String, CallError>,
    },
    AudioFetched {
        playback: PlaybackId,
        result: Result<PlayableAudio, CallError>,
    },
    PlaybackDone {
        playback: PlaybackId,
        result: PlaybackResult,
    },
    Connection(ConnectionState),
    Command(Command),
    PauseDeadline,
    CaptureRevoked,
    Tick,
}

/// Control surface of a running call
pub struct CallHandle {
    session: CallSession,
    commands: mpsc::UnboundedSender<EngineEvent>,
    snapshot: watch::Receiver<CallSnapshot>,
    task: JoinHandle<CallSummary>,
}

impl CallHandle {
    pub fn session(&self) -> &CallSession {
        &self.session
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Returns false once the call has ended
    pub fn set_muted(&self, muted: bool) -> bool {
        self.command(Command::SetMuted(muted))
    }

    /// Finalize the current utterance now instead of waiting for silence
    pub fn finish_utterance(&self) -> bool {
        self.command(Command::FinishUtterance)
    }

    /// Ask the engine to hang up without waiting for it
    pub fn end(&self) -> bool {
        self.command(Command::EndCall)
    }

    /// Resolves once the engine has stopped, for whatever reason
    pub async fn closed(&self) {
        self.commands.closed().await
    }

    /// Hang up and wait for teardown
    pub async fn end_call(self) -> Result<CallSummary, CallError> {
        self.end();
        self.join().await
    }

    /// Wait for the call to end on its own
    pub async fn join(self) -> Result<CallSummary, CallError> {
        self.task
            .await
            .map_err(|e| CallError::Internal(format!("call engine task failed: {}", e)))
    }

    fn command(&self, command: Command) -> bool {
        self.commands.send(EngineEvent::Command(command)).is_ok()
    }
}

/// Place a call
///
/// Starts the backend session, connects the transport (waiting for the open
/// acknowledgment), sends `start_listening` and starts capture. Any failure
/// here aborts the call: the transport is closed, the backend session is ended
/// and the error is returned for the user-facing alert.
pub async fn start_call(
    settings: CallSettings,
    character: CharacterRef,
    deps: CallDeps,
) -> Result<CallHandle, CallError> {
    settings.validate()?;
    if settings.capture_strategy == CaptureStrategy::Energy
        && settings.outbound_audio == OutboundAudio::Transcribe
        && deps.transcriber.is_none()
    {
        return Err(CallError::Config(
            "outbound_audio 'transcribe' needs a transcriber".to_string(),
        ));
    }
    if settings.capture_strategy == CaptureStrategy::Recognizer && deps.recognizer.is_none() {
        return Err(CallError::Config(
            "capture_strategy 'recognizer' needs a speech recognizer".to_string(),
        ));
    }

    let info = deps.backend.start_session(character.id.as_deref()).await?;
    let session = CallSession {
        session_id: info.session_id,
        character_id: character.id,
        character_name: character.name,
        voice_id: info.voice_id,
        started_at: Utc::now(),
    };

    let transport = SessionTransport::new(settings.api_base_url.clone(), settings.connect_timeout());
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    transport.bus().subscribe(Topic::Any, |msg| {
        log::debug!("Inbound message: {}", msg.kind().as_str());
    });
    for kind in ENGINE_KINDS {
        let tx = events_tx.clone();
        transport.bus().subscribe(Topic::Kind(kind), move |msg| {
            let _ = tx.send(EngineEvent::Inbound(msg.clone()));
        });
    }

    // Subscribed before connecting so a drop right after the handshake still arrives
    let mut state_rx = transport.watch_state();
    if let Err(e) = transport.connect(&session.session_id).await {
        transport.close();
        if let Err(end_err) = deps.backend.end_session(&session.session_id).await {
            log::warn!("Failed to end session {} after connect failure: {}", session.session_id, end_err);
        }
        return Err(CallError::Connect(e));
    }

    // Forward connection state changes into the engine
    let state_tx = events_tx.clone();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow_and_update();
            if state_tx.send(EngineEvent::Connection(state)).is_err() {
                break;
            }
        }
    });

    let lease = deps.capture.acquire(format!("call:{}", session.session_id));
    let pipeline = VoicePipeline::from_settings(&settings);
    log::info!(
        "Call {} connected ({:?} capture, {:?} outbound audio)",
        session.session_id, pipeline.strategy(), settings.outbound_audio
    );

    let initial = CallSnapshot {
        connection: transport.state(),
        turn: TurnState::Idle,
        muted: false,
        elapsed_secs: 0,
        last_ai_text: None,
    };
    let (snapshot_tx, snapshot_rx) = watch::channel(initial);

    let mut engine = CallEngine {
        reconnect: ReconnectPolicy {
            max_attempts: settings.reconnect_attempts,
            backoff_step: Duration::from_millis(settings.reconnect_backoff_ms),
        },
        settings,
        session: session.clone(),
        transport,
        backend: deps.backend,
        microphone: deps.microphone,
        recognizer: deps.recognizer,
        sink: deps.sink,
        transcriber: deps.transcriber,
        http: deps.http,
        lease: Some(lease),
        events: events_tx.clone(),
        turn: TurnController::new(),
        pipeline,
        capture_epoch: 0,
        muted: false,
        revoked: false,
        transcription: None,
        next_playback: 0,
        audio: HashMap::new(),
        conversation: Vec::new(),
        last_ai_text: None,
        snapshot: snapshot_tx,
        running: false,
        end: None,
    };

    engine.begin();
    if let Some(reason) = engine.end.take() {
        let summary = engine.shutdown(reason).await;
        return Err(match summary.reason {
            EndReason::Failed(e) => e,
            other => CallError::Internal(format!("call ended during setup: {}", other)),
        });
    }

    let task = tokio::spawn(engine.run(events_rx));
    Ok(CallHandle {
        session,
        commands: events_tx,
        snapshot: snapshot_rx,
        task,
    })
}

struct CallEngine {
    settings: CallSettings,
    session: CallSession,
    transport: SessionTransport,
    backend: Arc<dyn CallBackend>,
    microphone: Box<dyn MicrophoneSource>,
    recognizer: Option<Box<dyn SpeechRecognizer>>,
    sink: Box<dyn AudioSink>,
    transcriber: Option<Arc<dyn Transcriber>>,
    http: reqwest::Client,
    lease: Option<CaptureLease>,
    events: mpsc::UnboundedSender<EngineEvent>,
    turn: TurnController,
    pipeline: VoicePipeline,
    capture_epoch: CaptureEpoch,
    muted: bool,
    revoked: bool,
    transcription: Option<(UtteranceId, AbortHandle)>,
    next_playback: PlaybackId,
    audio: HashMap<PlaybackId, AudioSource>,
    conversation: Vec<ConversationTurn>,
    last_ai_text: Option<String>,
    snapshot: watch::Sender<CallSnapshot>,
    reconnect: ReconnectPolicy,
    /// Set once setup succeeded and the event loop took over
    running: bool,
    end: Option<EndReason>,
}

async fn lease_revoked(lease: &mut Option<CaptureLease>) {
    match lease {
        Some(lease) => lease.revoked().await,
        None => std::future::pending().await,
    }
}

impl CallEngine {
    fn begin(&mut self) {
        self.transport.send(&OutgoingMessage::start_listening(
            self.settings.language.clone(),
            self.settings.sample_rate,
        ));
        if let Some(t) = self.turn.start() {
            self.apply(t);
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<EngineEvent>) -> CallSummary {
        self.running = true;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            let deadline = self.pipeline.wall_deadline();
            let watch_lease = !self.revoked && self.lease.is_some();

            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => EngineEvent::Command(Command::EndCall),
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline.unwrap_or_else(Instant::now))),
                    if deadline.is_some() => EngineEvent::PauseDeadline,
                _ = lease_revoked(&mut self.lease), if watch_lease => EngineEvent::CaptureRevoked,
                _ = ticker.tick() => EngineEvent::Tick,
            };

            match event {
                EngineEvent::Connection(ConnectionState::Failed) => {
                    self.publish();
                    self.on_transport_failed(&mut events).await;
                }
                event => self.handle(event),
            }

            if let Some(reason) = self.end.take() {
                return self.shutdown(reason).await;
            }
        }
    }

    fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Inbound(msg) => self.on_inbound(msg),
            EngineEvent::Frame(frame) => self.on_frame(frame),
            EngineEvent::Recognized(event) => self.on_recognized(event),
            EngineEvent::Transcribed { utterance, result } => self.on_transcribed(utterance, result),
            EngineEvent::AudioFetched { playback, result } => self.on_audio_fetched(playback, result),
            EngineEvent::PlaybackDone { playback, result } => self.on_playback_done(playback, result),
            EngineEvent::Connection(state) => self.on_connection(state),
            EngineEvent::Command(command) => self.on_command(command),
            EngineEvent::PauseDeadline => {
                if let Some(utterance) = self.pipeline.on_wall_deadline(Instant::now()) {
                    self.on_utterance(utterance);
                }
            }
            EngineEvent::CaptureRevoked => {
                log::warn!("Microphone taken by another owner, capture disabled");
                self.revoked = true;
                self.update_capture_gate();
            }
            EngineEvent::Tick => self.publish(),
        }
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    fn on_inbound(&mut self, msg: IncomingMessage) {
        match msg {
            IncomingMessage::SessionStarted { session_id } => {
                if session_id != self.session.session_id {
                    log::warn!("Backend reported session {} on call {}", session_id, self.session.session_id);
                } else {
                    log::info!("✓ Backend session {} started", session_id);
                }
            }
            IncomingMessage::ListeningStarted { message } => log::debug!("Backend listening: {}", message),
            IncomingMessage::ListeningStopped { message } => log::debug!("Backend stopped listening: {}", message),
            IncomingMessage::Transcription { text, confidence, is_final } => {
                log::debug!("Server transcription ({:.2}, final: {}): {}", confidence, is_final, text);
            }
            IncomingMessage::AiResponseText { text, .. } => {
                log::info!("AI: {}", text);
                self.record(Speaker::Ai, text.clone());
                self.last_ai_text = Some(text);
                self.publish();
            }
            IncomingMessage::AiResponseAudio { audio_data, audio_url } => {
                self.on_ai_audio(&audio_data, &audio_url);
            }
            IncomingMessage::Error { message, details } => {
                match &details {
                    Some(details) => log::warn!("Backend error: {} ({})", message, details),
                    None => log::warn!("Backend error: {}", message),
                }
                self.record(Speaker::System, message);
            }
        }
    }

    fn on_connection(&mut self, state: ConnectionState) {
        self.publish();
        if state == ConnectionState::Closed && self.end.is_none() {
            log::info!("Call closed by server");
            self.end = Some(EndReason::RemoteHangup);
        }
    }

    async fn on_transport_failed(&mut self, events: &mut mpsc::UnboundedReceiver<EngineEvent>) {
        if self.transport.state() == ConnectionState::Open {
            log::debug!("Stale transport failure, connection is open again");
            return;
        }

        log::error!("✗ Call transport lost");
        if let Some(t) = self.turn.suspend() {
            self.apply(t);
        }
        self.sink.stop();
        self.audio.clear();

        if !self.reconnect.is_enabled() {
            self.end = Some(EndReason::Failed(CallError::Transport("connection lost".to_string())));
            return;
        }

        let mut attempt = 0;
        while let Some(delay) = self.reconnect.delay_for(attempt + 1) {
            attempt += 1;
            log::warn!("Reconnecting in {:?} (attempt {}/{})", delay, attempt, self.reconnect.max_attempts);

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    event = events.recv() => match event {
                        Some(EngineEvent::Command(Command::EndCall)) | None => {
                            log::info!("Call ended while reconnecting");
                            self.end = Some(EndReason::UserEnded);
                            return;
                        }
                        Some(EngineEvent::Command(Command::SetMuted(muted))) => self.set_muted(muted),
                        Some(_) => log::debug!("Dropping event while reconnecting"),
                    },
                }
            }

            match self.transport.connect(&self.session.session_id).await {
                Ok(()) => {
                    log::info!("✓ Call transport reconnected after {} attempt(s)", attempt);
                    self.transport.send(&OutgoingMessage::start_listening(
                        self.settings.language.clone(),
                        self.settings.sample_rate,
                    ));
                    if let Some(t) = self.turn.start() {
                        self.apply(t);
                    }
                    return;
                }
                Err(e) => log::warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }

        self.end = Some(EndReason::Failed(CallError::Transport(format!(
            "connection lost, {} reconnect attempt(s) failed",
            attempt
        ))));
    }

    // ---------------------------------------------------------------------
    // Capture and outbound
    // ---------------------------------------------------------------------

    fn on_frame(&mut self, frame: AudioFrame) {
        if frame.epoch != self.capture_epoch || !self.microphone.is_running() {
            log::trace!("Dropping stale frame from capture epoch {}", frame.epoch);
            return;
        }
        if let Some(utterance) = self.pipeline.push_frame(&frame.samples) {
            self.on_utterance(utterance);
        }
    }

    fn on_recognized(&mut self, event: RecognizedEvent) {
        if event.epoch != self.capture_epoch || !self.capture_running() {
            log::trace!("Dropping stale recognizer result from capture epoch {}", event.epoch);
            return;
        }
        if let Some(utterance) = self.pipeline.push_recognizer(event.event, Instant::now()) {
            self.on_utterance(utterance);
        }
    }

    fn on_utterance(&mut self, utterance: Utterance) {
        let id = utterance.id;
        let Some(t) = self.turn.begin_finalize(id) else {
            return;
        };
        self.apply(t);
        log::info!("Utterance {} finalized ({:?})", id, utterance.cause);

        match prepare_outbound(utterance, self.settings.outbound_audio) {
            Ok(Outbound::Ready(message)) => self.hand_off(id, message),
            Ok(Outbound::Transcribe { samples, sample_rate }) => match &self.transcriber {
                Some(transcriber) => {
                    let transcriber = transcriber.clone();
                    let tx = self.events.clone();
                    let task = tokio::spawn(async move {
                        let result = transcriber.transcribe(samples, sample_rate).await;
                        let _ = tx.send(EngineEvent::Transcribed { utterance: id, result });
                    });
                    self.transcription = Some((id, task.abort_handle()));
                }
                None => {
                    log::warn!("No transcriber configured, dropping utterance {}", id);
                    self.abandon(id);
                }
            },
            Err(e) => {
                log::warn!("Dropping utterance {}: {}", id, e);
                self.abandon(id);
            }
        }
    }

    fn on_transcribed(&mut self, utterance: UtteranceId, result: Result<String, CallError>) {
        match &self.transcription {
            Some((id, _)) if *id == utterance => self.transcription = None,
            _ => {
                log::debug!("Ignoring transcription of cancelled utterance {}", utterance);
                return;
            }
        }

        match result {
            Ok(text) => match transcript_message(&text) {
                Some(message) => self.hand_off(utterance, message),
                None => {
                    log::debug!("Empty transcription, dropping utterance {}", utterance);
                    self.abandon(utterance);
                }
            },
            Err(e) => {
                log::warn!("Transcription failed, dropping utterance {}: {}", utterance, e);
                self.abandon(utterance);
            }
        }
    }

    /// Give the utterance's one message to the transport and re-arm listening
    fn hand_off(&mut self, utterance: UtteranceId, message: OutgoingMessage) {
        if self.transport.send(&message) {
            let text = match &message {
                OutgoingMessage::TextInput { text } => text.clone(),
                _ => "[audio]".to_string(),
            };
            self.record(Speaker::User, text);
        }
        if let Some(t) = self.turn.complete_handoff(utterance) {
            self.apply(t);
        }
    }

    fn abandon(&mut self, utterance: UtteranceId) {
        if let Some(t) = self.turn.abandon_utterance(utterance) {
            self.apply(t);
        }
    }

    // ---------------------------------------------------------------------
    // AI audio
    // ---------------------------------------------------------------------

    fn on_ai_audio(&mut self, audio_data: &str, audio_url: &str) {
        self.next_playback += 1;
        let id = self.next_playback;

        // Preempt first, before anything else can look at capture
        let arrival = self.turn.ai_audio_arrived(id);
        if let Some(t) = arrival.transition {
            self.apply(t);
        }

        match resolve_audio_source(&self.settings.api_base_url, audio_data, audio_url) {
            Ok(source) => {
                self.audio.insert(id, source);
            }
            Err(e) => log::warn!("AI audio {} unusable: {}", id, e),
        }

        if arrival.play_now {
            self.start_playback(id);
        }
    }

    fn start_playback(&mut self, id: PlaybackId) {
        match self.audio.remove(&id) {
            Some(AudioSource::Inline(data)) => match decode_inline(&data) {
                Ok(audio) => self.play(id, audio),
                Err(e) => self.on_playback_done(id, Err(e)),
            },
            Some(AudioSource::Remote(url)) => {
                let client = self.http.clone();
                let tx = self.events.clone();
                tokio::spawn(async move {
                    let result = fetch_audio(&client, url).await;
                    let _ = tx.send(EngineEvent::AudioFetched { playback: id, result });
                });
            }
            None => self.on_playback_done(id, Err(CallError::Playback("no playable audio".to_string()))),
        }
    }

    fn on_audio_fetched(&mut self, id: PlaybackId, result: Result<PlayableAudio, CallError>) {
        if self.turn.current_playback() != Some(id) {
            log::debug!("Ignoring fetched audio {} that is no longer current", id);
            return;
        }
        match result {
            Ok(audio) => self.play(id, audio),
            Err(e) => self.on_playback_done(id, Err(e)),
        }
    }

    fn play(&mut self, id: PlaybackId, audio: PlayableAudio) {
        let tx = self.events.clone();
        let done = PlaybackCompletion::new(id, move |playback, result| {
            let _ = tx.send(EngineEvent::PlaybackDone { playback, result });
        });
        self.sink.play(audio, done);
    }

    fn on_playback_done(&mut self, id: PlaybackId, result: PlaybackResult) {
        let outcome = self.turn.playback_finished(id);
        if outcome == PlaybackOutcome::Ignored {
            return;
        }
        if let Err(e) = result {
            log::warn!("AI audio {} failed, treating as finished: {}", id, e);
        }

        match outcome {
            PlaybackOutcome::Next(next) => self.start_playback(next),
            PlaybackOutcome::Resumed(t) => self.apply(t),
            PlaybackOutcome::Ignored => {}
        }
    }

    // ---------------------------------------------------------------------
    // Commands and gating
    // ---------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        match command {
            Command::EndCall => {
                if self.end.is_none() {
                    self.end = Some(EndReason::UserEnded);
                }
            }
            Command::SetMuted(muted) => self.set_muted(muted),
            Command::FinishUtterance => match self.pipeline.finish_now() {
                Some(utterance) => self.on_utterance(utterance),
                None => log::debug!("Nothing to finish"),
            },
        }
    }

    fn set_muted(&mut self, muted: bool) {
        if self.muted == muted {
            return;
        }
        self.muted = muted;
        log::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        self.update_capture_gate();
    }

    fn capture_blocked(&self) -> bool {
        self.muted || self.revoked
    }

    fn update_capture_gate(&mut self) {
        let blocked = self.capture_blocked();
        if self.pipeline.set_muted(blocked) {
            log::info!("Discarded in-flight utterance");
        }
        if blocked {
            self.stop_capture();
        } else {
            self.start_capture();
        }
        self.publish();
    }

    /// Apply the side effects of a turn transition
    fn apply(&mut self, t: Transition) {
        if t.cancelled.is_some() {
            if let Some((id, task)) = self.transcription.take() {
                log::debug!("Cancelling transcription of utterance {}", id);
                task.abort();
            }
        }

        if t.to == TurnState::Listening {
            self.pipeline.open();
            self.start_capture();
        } else {
            if self.pipeline.cancel() {
                log::info!("Discarded in-flight utterance");
            }
            self.stop_capture();
        }
        self.publish();
    }

    /// Whatever the capture strategy listens with is running
    fn capture_running(&self) -> bool {
        match self.pipeline.strategy() {
            CaptureStrategy::Energy => self.microphone.is_running(),
            CaptureStrategy::Recognizer => self.recognizer.as_ref().is_some_and(|r| r.is_running()),
        }
    }

    fn start_capture(&mut self) {
        if self.capture_blocked() || !self.turn.may_capture() || self.capture_running() {
            return;
        }

        self.capture_epoch += 1;
        let epoch = self.capture_epoch;
        let tx = self.events.clone();
        let started = match self.pipeline.strategy() {
            CaptureStrategy::Energy => {
                let frames = FrameSender::new(epoch, move |frame| tx.send(EngineEvent::Frame(frame)).is_ok());
                self.microphone.start(frames)
            }
            CaptureStrategy::Recognizer => match self.recognizer.as_mut() {
                Some(recognizer) => {
                    let results = ResultSender::new(epoch, move |event| tx.send(EngineEvent::Recognized(event)).is_ok());
                    recognizer.start(results)
                }
                None => Err(CallError::Config("no speech recognizer".to_string())),
            },
        };

        if let Err(e) = started {
            log::error!("✗ Failed to start capture: {}", e);
            if self.end.is_none() {
                self.end = Some(EndReason::Failed(e));
            }
        }
    }

    fn stop_capture(&mut self) {
        if self.microphone.is_running() {
            self.microphone.stop();
        }
        if let Some(recognizer) = self.recognizer.as_mut() {
            if recognizer.is_running() {
                recognizer.stop();
            }
        }
    }

    fn record(&mut self, speaker: Speaker, text: String) {
        self.conversation.push(ConversationTurn {
            speaker,
            text,
            at: Utc::now(),
        });
    }

    fn publish(&self) {
        let next = CallSnapshot {
            connection: self.transport.state(),
            turn: self.turn.state(),
            muted: self.capture_blocked(),
            elapsed_secs: self.session.elapsed_secs(),
            last_ai_text: self.last_ai_text.clone(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// End the call: timers, capture, drain and close, release media, notify backend
    async fn shutdown(mut self, reason: EndReason) -> CallSummary {
        match &reason {
            EndReason::Failed(_) => log::error!("✗ Call {} {}", self.session.session_id, reason),
            other => log::info!("Call {} {}", self.session.session_id, other),
        }

        self.pipeline.cancel();
        if let Some((_, task)) = self.transcription.take() {
            task.abort();
        }
        self.turn.teardown();

        if self.transport.is_open() {
            self.transport.send(&OutgoingMessage::StopListening);
        }
        self.transport.close_and_drain(CLOSE_GRACE).await;

        self.stop_capture();
        self.sink.stop();
        self.audio.clear();
        drop(self.lease.take());
        self.publish();

        if let Err(e) = self.backend.end_session(&self.session.session_id).await {
            log::warn!("Failed to end session {}: {}", self.session.session_id, e);
        }

        let duration_secs = self.session.elapsed_secs();
        match &self.session.character_id {
            Some(character_id) if self.running => {
                if let Err(e) = self.backend.log_usage(character_id, duration_secs).await {
                    log::warn!("Failed to log call usage: {}", e);
                }
            }
            Some(_) => log::debug!("Call never got past setup, no usage logged"),
            None => {}
        }

        log::info!("Call lasted {}", format_duration(duration_secs));
        CallSummary {
            session: self.session,
            duration_secs,
            reason,
            conversation: self.conversation,
        }
    }
}
