//! Transcription & Playback Bridge
//!
//! Outbound: a finalized utterance becomes exactly one wire message. Text from
//! the recognizer goes straight out as `text_input`; captured audio is either
//! forwarded as `audio_input` or run through a `Transcriber` first and sent as
//! `text_input`, never both.
//!
//! Inbound: AI audio is resolved (inline base64 or a URL to fetch), decoded and
//! handed to an `AudioSink` together with a `PlaybackCompletion` that reports
//! the outcome exactly once.

use crate::codec::{decode_from_transport_format, encode_to_transport_format, PlayableAudio, TRANSPORT_FORMAT};
use crate::config::OutboundAudio;
use crate::error::{CallError, IntoCallError};
use crate::protocol::OutgoingMessage;
use crate::turn::PlaybackId;
use crate::vad::{Utterance, UtteranceContent};
use async_trait::async_trait;
use url::Url;

/// Speech-to-text for captured utterances
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, samples: Vec<f32>, sample_rate: u32) -> Result<String, CallError>;
}

/// What a finalized utterance needs before it can go on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Ready(OutgoingMessage),
    Transcribe { samples: Vec<f32>, sample_rate: u32 },
}

pub fn prepare_outbound(utterance: Utterance, mode: OutboundAudio) -> Result<Outbound, CallError> {
    match utterance.content {
        UtteranceContent::Text(text) => Ok(Outbound::Ready(OutgoingMessage::text_input(text))),
        UtteranceContent::Audio { samples, sample_rate } => match mode {
            OutboundAudio::Forward => {
                let data = encode_to_transport_format(&samples, sample_rate)?;
                Ok(Outbound::Ready(OutgoingMessage::audio_input(data, TRANSPORT_FORMAT)))
            }
            OutboundAudio::Transcribe => Ok(Outbound::Transcribe { samples, sample_rate }),
        },
    }
}

/// Turn a transcription result into the outbound message; blank text is dropped
pub fn transcript_message(text: &str) -> Option<OutgoingMessage> {
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(OutgoingMessage::text_input(text))
    }
}

// =========================================================================
// Inbound audio
// =========================================================================

/// Where the bytes of an AI audio message come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    Inline(String),
    Remote(Url),
}

/// Prefer inline data; fall back to `audio_url`, resolved against the backend origin
pub fn resolve_audio_source(origin: &str, audio_data: &str, audio_url: &str) -> Result<AudioSource, CallError> {
    if !audio_data.trim().is_empty() {
        return Ok(AudioSource::Inline(audio_data.to_string()));
    }

    let audio_url = audio_url.trim();
    if audio_url.is_empty() {
        return Err(CallError::Playback("AI audio message carried no audio".to_string()));
    }

    let url = match Url::parse(audio_url) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(origin)
            .and_then(|base| base.join(audio_url))
            .map_call_err(|e| CallError::Playback(format!("Invalid audio URL {}: {}", audio_url, e)))?,
        Err(e) => return Err(CallError::Playback(format!("Invalid audio URL {}: {}", audio_url, e))),
    };
    Ok(AudioSource::Remote(url))
}

pub fn decode_inline(data: &str) -> Result<PlayableAudio, CallError> {
    decode_from_transport_format(data)
}

pub async fn fetch_audio(client: &reqwest::Client, url: Url) -> Result<PlayableAudio, CallError> {
    log::debug!("Fetching AI audio from {}", url);
    let response = client.get(url.clone()).send().await?;
    if !response.status().is_success() {
        return Err(CallError::Playback(format!(
            "Audio fetch from {} failed with HTTP {}",
            url,
            response.status()
        )));
    }
    let bytes = response.bytes().await?;
    PlayableAudio::from_bytes(bytes.to_vec())
}

// =========================================================================
// Playback
// =========================================================================

pub type PlaybackResult = Result<(), CallError>;

type CompletionFn = Box<dyn FnOnce(PlaybackId, PlaybackResult) + Send>;

/// Reports the end of one playback exactly once
///
/// Consumed by `complete`; a completion dropped without being completed
/// reports a failure, so the turn can never get stuck in AISpeaking.
pub struct PlaybackCompletion {
    id: PlaybackId,
    notify: Option<CompletionFn>,
}

impl PlaybackCompletion {
    pub fn new<F>(id: PlaybackId, notify: F) -> Self
    where
        F: FnOnce(PlaybackId, PlaybackResult) + Send + 'static,
    {
        Self {
            id,
            notify: Some(Box::new(notify)),
        }
    }

    pub fn id(&self) -> PlaybackId {
        self.id
    }

    pub fn complete(mut self, result: PlaybackResult) {
        self.fire(result);
    }

    fn fire(&mut self, result: PlaybackResult) {
        if let Some(notify) = self.notify.take() {
            notify(self.id, result);
        }
    }
}

impl Drop for PlaybackCompletion {
    fn drop(&mut self) {
        if self.notify.is_some() {
            self.fire(Err(CallError::Playback("playback abandoned".to_string())));
        }
    }
}

impl std::fmt::Debug for PlaybackCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackCompletion")
            .field("id", &self.id)
            .field("pending", &self.notify.is_some())
            .finish()
    }
}

/// Output device for AI audio
pub trait AudioSink: Send {
    /// Start playing; `done` must be completed when playback ends or fails
    fn play(&mut self, audio: PlayableAudio, done: PlaybackCompletion);

    /// Stop whatever is playing. Pending completions may fire with an error.
    fn stop(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::vad::FinalizeCause;
    use std::sync::{Arc, Mutex};

    fn utterance(content: UtteranceContent) -> Utterance {
        Utterance {
            id: 1,
            started_at: Utc::now(),
            cause: FinalizeCause::Silence,
            content,
        }
    }

    #[test]
    fn test_text_utterance_becomes_text_input() {
        let out = prepare_outbound(utterance(UtteranceContent::Text("hi".into())), OutboundAudio::Transcribe).unwrap();
        assert_eq!(out, Outbound::Ready(OutgoingMessage::text_input("hi")));
    }

    #[test]
    fn test_audio_utterance_is_forwarded_or_transcribed() {
        let audio = UtteranceContent::Audio {
            samples: vec![0.2; 320],
            sample_rate: 16000,
        };

        match prepare_outbound(utterance(audio.clone()), OutboundAudio::Forward).unwrap() {
            Outbound::Ready(OutgoingMessage::AudioInput { data, format }) => {
                assert!(!data.is_empty());
                assert_eq!(format.as_deref(), Some("wav"));
            }
            other => panic!("unexpected outbound: {:?}", other),
        }

        match prepare_outbound(utterance(audio), OutboundAudio::Transcribe).unwrap() {
            Outbound::Transcribe { samples, sample_rate } => {
                assert_eq!(samples.len(), 320);
                assert_eq!(sample_rate, 16000);
            }
            other => panic!("unexpected outbound: {:?}", other),
        }
    }

    #[test]
    fn test_blank_transcripts_are_dropped() {
        assert_eq!(transcript_message("  "), None);
        assert_eq!(transcript_message(" 안녕 "), Some(OutgoingMessage::text_input("안녕")));
    }

    #[test]
    fn test_audio_source_resolution() {
        let origin = "https://api.example.com";
        assert_eq!(
            resolve_audio_source(origin, "UklGRg==", "/ignored.mp3").unwrap(),
            AudioSource::Inline("UklGRg==".into())
        );
        assert_eq!(
            resolve_audio_source(origin, "", "/v1/audio/a.mp3").unwrap(),
            AudioSource::Remote(Url::parse("https://api.example.com/v1/audio/a.mp3").unwrap())
        );
        assert_eq!(
            resolve_audio_source(origin, "", "https://cdn.example.com/b.mp3").unwrap(),
            AudioSource::Remote(Url::parse("https://cdn.example.com/b.mp3").unwrap())
        );
        assert!(resolve_audio_source(origin, " ", "").is_err());
    }

    #[test]
    fn test_completion_fires_once_and_on_drop() {
        let seen: Arc<Mutex<Vec<(PlaybackId, bool)>>> = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let done = PlaybackCompletion::new(1, move |id, result| s.lock().unwrap().push((id, result.is_ok())));
        done.complete(Ok(()));

        let s = seen.clone();
        let dropped = PlaybackCompletion::new(2, move |id, result| s.lock().unwrap().push((id, result.is_ok())));
        drop(dropped);

        assert_eq!(*seen.lock().unwrap(), vec![(1, true), (2, false)]);
    }
}
