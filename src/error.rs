/// Unified error handling for the call client
///
/// This module provides a centralized error type that encompasses every failure
/// the call engine can run into. Using `thiserror`, we derive the Error trait
/// and keep one variant per failure domain so callers can decide between a
/// blocking alert and a silent local recovery.

use thiserror::Error;

/// Why opening the call transport failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// No open acknowledgment arrived within the connect timeout
    #[error("connection timed out after {0}ms")]
    Timeout(u64),

    /// The connection closed before the handshake completed
    #[error("connection closed during handshake")]
    ClosedDuringHandshake,

    /// The backend actively refused the TCP connection
    #[error("connection refused: {0}")]
    Refused(String),

    /// The backend answered the upgrade request with a non-101 status
    #[error("handshake rejected with HTTP {status}")]
    Rejected { status: u16 },

    /// The configured origin could not be turned into a WebSocket URL
    #[error("invalid call URL: {0}")]
    InvalidUrl(String),

    #[error("{0}")]
    Other(String),
}

/// Main error type for all call operations
#[derive(Error, Debug)]
pub enum CallError {
    /// Opening the session transport failed
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    /// The transport dropped or misbehaved after it was open
    #[error("Transport error: {0}")]
    Transport(String),

    /// Microphone capture errors (no device, stream failure)
    #[error("Microphone error: {0}")]
    Microphone(String),

    /// The user (or the OS) refused microphone access
    #[error("Microphone permission denied: {0}")]
    MicrophoneDenied(String),

    /// Speech-to-text errors on a finalized utterance
    #[error("Transcription error: {0}")]
    Transcription(String),

    /// AI audio playback errors (decode, output device)
    #[error("Playback error: {0}")]
    Playback(String),

    /// Audio payload encode/decode errors
    #[error("Codec error: {0}")]
    Codec(String),

    /// Session REST endpoint errors
    #[error("API error: {0}")]
    Api(String),

    /// Configuration and settings errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors (settings file, model loading)
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic errors for edge cases
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// Whether this failure ends the call.
    ///
    /// Connect failures, transport drops and microphone denial end the call;
    /// everything else is recovered inside the pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallError::Connect(_)
                | CallError::Transport(_)
                | CallError::Microphone(_)
                | CallError::MicrophoneDenied(_)
        )
    }

    /// Human-readable reason shown to the user when the call is aborted
    pub fn user_message(&self) -> String {
        match self {
            CallError::Connect(ConnectError::Timeout(_)) => {
                "The call could not be connected in time. Please check your network and try again.".to_string()
            }
            CallError::Connect(ConnectError::Refused(_)) => {
                "The call server refused the connection. Please try again later.".to_string()
            }
            CallError::Connect(_) => "The call could not be connected.".to_string(),
            CallError::Transport(_) => "The call was disconnected.".to_string(),
            CallError::MicrophoneDenied(_) => {
                "Microphone access is required for calls. Please allow microphone access in your settings.".to_string()
            }
            CallError::Microphone(_) => {
                "The microphone could not be started. Please check that it is connected.".to_string()
            }
            other => format!("Something went wrong: {}", other),
        }
    }
}

/// Helper trait to convert external error types to CallError
pub trait IntoCallError<T> {
    fn map_call_err<F>(self, f: F) -> Result<T, CallError>
    where
        F: FnOnce(String) -> CallError;
}

impl<T, E: std::fmt::Display> IntoCallError<T> for Result<T, E> {
    fn map_call_err<F>(self, f: F) -> Result<T, CallError>
    where
        F: FnOnce(String) -> CallError,
    {
        self.map_err(|e| f(e.to_string()))
    }
}

/// Implement Serialize for CallError so it can be handed to a UI layer
impl serde::Serialize for CallError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
