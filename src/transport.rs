/// Call Session Transport - WebSocket
///
/// Owns the one persistent duplex connection of a call. Outbound messages go
/// through a writer task that drains a queue; inbound frames are parsed by a
/// reader task and dispatched on the event bus in arrival order.

use crate::bus::EventBus;
use crate::error::ConnectError;
use crate::protocol::{IncomingMessage, OutgoingMessage};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tungstenite::error::ProtocolError;
use tungstenite::protocol::Message;
use url::Url;

/// Path appended to the backend origin, followed by the session id
const CALL_WS_PATH: [&str; 4] = ["v1", "call", "ws", "call"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// Closed by us, or by the server with a close frame
    Closed,
    /// Connect failed, or the connection dropped without a close frame
    Failed,
}

/// Bounded reconnection with linear backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            backoff_step: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Delay before the given 1-based attempt, `None` once attempts are exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(self.backoff_step * attempt)
    }
}

/// Convert the configured backend origin to the call WebSocket URL
///
/// `https://host/base` becomes `wss://host/base/v1/call/ws/call/{session_id}`.
pub fn call_ws_url(origin: &str, session_id: &str) -> Result<Url, ConnectError> {
    if session_id.trim().is_empty() {
        return Err(ConnectError::InvalidUrl("empty session id".to_string()));
    }

    let mut url = Url::parse(origin)
        .map_err(|e| ConnectError::InvalidUrl(format!("{}: {}", origin, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConnectError::InvalidUrl(format!(
                "unsupported scheme '{}' in {}",
                other, origin
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectError::InvalidUrl(format!("cannot use {} with {}", scheme, origin)))?;
    url.set_query(None);
    url.set_fragment(None);

    url.path_segments_mut()
        .map_err(|_| ConnectError::InvalidUrl(format!("{} cannot carry a path", origin)))?
        .pop_if_empty()
        .extend(CALL_WS_PATH)
        .push(session_id);

    Ok(url)
}

fn classify_connect_error(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            ConnectError::Refused(e.to_string())
        }
        tungstenite::Error::Io(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ) =>
        {
            ConnectError::ClosedDuringHandshake
        }
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(ProtocolError::HandshakeIncomplete) => {
            ConnectError::ClosedDuringHandshake
        }
        tungstenite::Error::Http(response) => ConnectError::Rejected {
            status: response.status().as_u16(),
        },
        tungstenite::Error::Url(e) => ConnectError::InvalidUrl(e.to_string()),
        other => ConnectError::Other(other.to_string()),
    }
}

pub struct SessionTransport {
    origin: String,
    connect_timeout: Duration,
    bus: Arc<EventBus>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

impl SessionTransport {
    pub fn new(origin: impl Into<String>, connect_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Self {
            origin: origin.into(),
            connect_timeout,
            bus: Arc::new(EventBus::new()),
            state_tx: Arc::new(state_tx),
            outbound: Mutex::new(None),
            writer: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Inbound message subscriptions
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open && !self.closing.load(Ordering::SeqCst)
    }

    /// Open the connection for a session
    ///
    /// Resolves only once the WebSocket handshake has completed. Fails with
    /// `Timeout` when the handshake does not finish within the connect timeout.
    pub async fn connect(&self, session_id: &str) -> Result<(), ConnectError> {
        let url = call_ws_url(&self.origin, session_id)?;

        self.closing.store(false, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state_tx.send_replace(ConnectionState::Connecting);

        log::info!("Connecting to call transport at {}", url);

        let attempt = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())).await;
        let ws_stream = match attempt {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                let err = classify_connect_error(e);
                log::error!("✗ Call transport connect failed: {}", err);
                self.state_tx.send_replace(ConnectionState::Failed);
                return Err(err);
            }
            Err(_) => {
                let ms = self.connect_timeout.as_millis() as u64;
                log::error!("✗ Call transport connect timed out after {}ms", ms);
                self.state_tx.send_replace(ConnectionState::Failed);
                return Err(ConnectError::Timeout(ms));
            }
        };

        if self.closing.load(Ordering::SeqCst) {
            // close() raced the handshake; honour it
            log::info!("Transport closed while connecting, dropping new connection");
            self.state_tx.send_replace(ConnectionState::Closed);
            return Err(ConnectError::ClosedDuringHandshake);
        }

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Writer: drain the queue in order, then say goodbye once every sender is gone
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write.send(frame).await {
                    log::warn!("Call transport write failed: {}", e);
                    return;
                }
            }
            if let Err(e) = write.close().await {
                log::debug!("Close handshake not completed: {}", e);
            }
        });

        // Open before the reader exists, so its terminal state always lands last
        *lock(&self.outbound) = Some(tx);
        *lock(&self.writer) = Some(writer);
        self.state_tx.send_replace(ConnectionState::Open);

        // Reader: parse and dispatch in arrival order
        let bus = self.bus.clone();
        let state_tx = self.state_tx.clone();
        let closing = self.closing.clone();
        let current_generation = self.generation.clone();
        tokio::spawn(async move {
            let mut remote_closed = false;

            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if closing.load(Ordering::SeqCst) {
                            log::debug!("Transport closing, ignoring inbound frame");
                            continue;
                        }
                        match IncomingMessage::parse(&text) {
                            Ok(msg) => {
                                bus.dispatch(&msg);
                            }
                            Err(e) => {
                                log::warn!("Dropping malformed inbound message: {} ({})", e, preview(&text));
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        match &frame {
                            Some(f) => log::info!("Call transport closed by server: {} {}", f.code, f.reason),
                            None => log::info!("Call transport closed by server"),
                        }
                        remote_closed = true;
                    }
                    Ok(Message::Binary(data)) => {
                        log::warn!("Ignoring {} byte binary frame", data.len());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if !closing.load(Ordering::SeqCst) && !remote_closed {
                            log::error!("Call transport error: {}", e);
                        }
                        break;
                    }
                }
            }

            if current_generation.load(Ordering::SeqCst) != generation {
                return;
            }

            let final_state = if closing.load(Ordering::SeqCst) || remote_closed {
                ConnectionState::Closed
            } else {
                log::error!("✗ Call transport dropped without a close frame");
                ConnectionState::Failed
            };
            state_tx.send_replace(final_state);
        });

        log::info!("✓ Call transport connected");
        Ok(())
    }

    /// Queue a message for the backend
    ///
    /// A no-op that logs `NotConnected` when the connection is not open; the
    /// call loop never fails on a send. Returns whether the message was queued.
    pub fn send(&self, message: &OutgoingMessage) -> bool {
        if !self.is_open() {
            log::warn!("NotConnected: dropping outbound {} message", message.type_name());
            return false;
        }

        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to serialize {} message: {}", message.type_name(), e);
                return false;
            }
        };

        match lock(&self.outbound).as_ref() {
            Some(tx) if tx.send(Message::Text(payload)).is_ok() => {
                log::debug!("Queued outbound {} message", message.type_name());
                true
            }
            _ => {
                log::warn!("NotConnected: writer gone, dropping {} message", message.type_name());
                false
            }
        }
    }

    /// Start a clean shutdown
    ///
    /// Clears every subscription, stops accepting sends and lets already queued
    /// frames drain before the close frame goes out. Safe to call repeatedly;
    /// returns false when the transport was already closing.
    pub fn close(&self) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            log::debug!("Call transport already closing");
            return false;
        }

        self.bus.clear();
        // Dropping the last sender lets the writer finish the queue and close
        drop(lock(&self.outbound).take());

        if self.state() != ConnectionState::Failed {
            self.state_tx.send_replace(ConnectionState::Closed);
        }
        log::info!("Call transport closing");
        true
    }

    /// `close()`, then wait up to `grace` for queued frames to flush
    pub async fn close_and_drain(&self, grace: Duration) {
        self.close();
        let writer = lock(&self.writer).take();
        if let Some(writer) = writer {
            if tokio::time::timeout(grace, writer).await.is_err() {
                log::warn!("Call transport writer did not drain within {:?}", grace);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn preview(text: &str) -> String {
    if text.chars().count() > 80 {
        format!("{}...", text.chars().take(80).collect::<String>())
    } else {
        text.to_string()
    }
}
