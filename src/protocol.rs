//! Wire messages exchanged with the call backend
//!
//! Every frame is a JSON object discriminated by its `type` field.

use serde::{Deserialize, Serialize};

/// Recognition parameters sent with `start_listening`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListeningConfig {
    pub language: String,
    pub sample_rate: u32,
}

/// Messages sent from the client to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingMessage {
    StartListening { config: ListeningConfig },
    StopListening,
    TextInput { text: String },
    /// Legacy/alternate path: a whole encoded utterance
    AudioInput {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
}

impl OutgoingMessage {
    pub fn start_listening(language: impl Into<String>, sample_rate: u32) -> Self {
        OutgoingMessage::StartListening {
            config: ListeningConfig {
                language: language.into(),
                sample_rate,
            },
        }
    }

    pub fn text_input(text: impl Into<String>) -> Self {
        OutgoingMessage::TextInput { text: text.into() }
    }

    pub fn audio_input(data: impl Into<String>, format: &str) -> Self {
        OutgoingMessage::AudioInput {
            data: data.into(),
            format: Some(format.to_string()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            OutgoingMessage::StartListening { .. } => "start_listening",
            OutgoingMessage::StopListening => "stop_listening",
            OutgoingMessage::TextInput { .. } => "text_input",
            OutgoingMessage::AudioInput { .. } => "audio_input",
        }
    }
}

/// Messages sent from the backend to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    SessionStarted {
        session_id: String,
    },
    ListeningStarted {
        #[serde(default)]
        message: String,
    },
    ListeningStopped {
        #[serde(default)]
        message: String,
    },
    Transcription {
        text: String,
        #[serde(default)]
        confidence: f64,
        #[serde(default)]
        is_final: bool,
    },
    AiResponseText {
        text: String,
        #[serde(default)]
        timestamp: String,
    },
    AiResponseAudio {
        #[serde(default)]
        audio_data: String,
        #[serde(default)]
        audio_url: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

/// Discriminant of an inbound message, used as a subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SessionStarted,
    ListeningStarted,
    ListeningStopped,
    Transcription,
    AiResponseText,
    AiResponseAudio,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::SessionStarted => "session_started",
            MessageKind::ListeningStarted => "listening_started",
            MessageKind::ListeningStopped => "listening_stopped",
            MessageKind::Transcription => "transcription",
            MessageKind::AiResponseText => "ai_response_text",
            MessageKind::AiResponseAudio => "ai_response_audio",
            MessageKind::Error => "error",
        }
    }
}

impl IncomingMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            IncomingMessage::SessionStarted { .. } => MessageKind::SessionStarted,
            IncomingMessage::ListeningStarted { .. } => MessageKind::ListeningStarted,
            IncomingMessage::ListeningStopped { .. } => MessageKind::ListeningStopped,
            IncomingMessage::Transcription { .. } => MessageKind::Transcription,
            IncomingMessage::AiResponseText { .. } => MessageKind::AiResponseText,
            IncomingMessage::AiResponseAudio { .. } => MessageKind::AiResponseAudio,
            IncomingMessage::Error { .. } => MessageKind::Error,
        }
    }

    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
