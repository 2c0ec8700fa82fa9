//! Real-time call client for AI companions
//!
//! A call is a backend session plus one WebSocket: the user's finalized
//! utterances go up as `text_input` / `audio_input`, the AI's replies come back
//! as text and audio, and a turn controller keeps the microphone closed while
//! the AI speaks.

pub mod api;
pub mod bridge;
pub mod bus;
pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod recognizer;
pub mod session;
pub mod timer;
pub mod transport;
pub mod turn;
pub mod vad;

#[cfg(feature = "native-audio")]
pub mod playback;
#[cfg(feature = "whisper")]
pub mod whisper;

#[cfg(test)]
mod testing;

pub use api::{CallBackend, HttpCallBackend};
pub use capture::CaptureManager;
pub use config::{CallSettings, CaptureStrategy, OutboundAudio};
pub use error::{CallError, ConnectError};
pub use session::{start_call, CallDeps, CallHandle, CallSnapshot, CallSummary, CharacterRef, EndReason};
pub use transport::ConnectionState;
pub use turn::TurnState;

/// Initialize `env_logger`, defaulting to `info` when `RUST_LOG` is unset
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}
