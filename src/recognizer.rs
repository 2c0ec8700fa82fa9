//! Streaming speech recognition on this machine
//!
//! A `SpeechRecognizer` listens by itself and reports its running hypothesis
//! as `RecognizerEvent`s; the recognizer strategy of the voice pipeline turns
//! those into utterances. `TranscribingRecognizer` builds one from a
//! microphone and a `Transcriber` by re-transcribing the growing utterance
//! audio every window.

use crate::bridge::Transcriber;
use crate::capture::{CaptureEpoch, FrameSender, MicrophoneSource};
use crate::config::CallSettings;
use crate::error::CallError;
use crate::vad::{calculate_rms_energy, RecognizerEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizedEvent {
    pub epoch: CaptureEpoch,
    pub event: RecognizerEvent,
}

type ResultFn = dyn Fn(RecognizedEvent) -> bool + Send + Sync;

/// Result delivery handle given to a recognizer when it starts
#[derive(Clone)]
pub struct ResultSender {
    epoch: CaptureEpoch,
    deliver: Arc<ResultFn>,
}

impl ResultSender {
    pub fn new<F>(epoch: CaptureEpoch, deliver: F) -> Self
    where
        F: Fn(RecognizedEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            epoch,
            deliver: Arc::new(deliver),
        }
    }

    pub fn epoch(&self) -> CaptureEpoch {
        self.epoch
    }

    /// Returns false once the receiving side is gone
    pub fn send(&self, event: RecognizerEvent) -> bool {
        (self.deliver)(RecognizedEvent {
            epoch: self.epoch,
            event,
        })
    }
}

pub trait SpeechRecognizer: Send {
    /// Start listening; fails with `MicrophoneDenied` when the input is refused
    fn start(&mut self, results: ResultSender) -> Result<(), CallError>;

    /// Stop listening and drop any partial hypothesis. Idempotent.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamingConfig {
    pub sample_rate: u32,
    /// New audio between two hypotheses
    pub window: Duration,
    /// RMS level below which audio does not start a hypothesis
    pub threshold: f32,
    /// Utterance audio is reported as final at this length
    pub max_utterance: Duration,
}

impl StreamingConfig {
    /// One hypothesis per second of new audio, gated and capped like energy capture
    pub fn from_settings(settings: &CallSettings) -> Self {
        Self {
            sample_rate: settings.sample_rate,
            window: Duration::from_secs(1),
            threshold: settings.vad_sensitivity,
            max_utterance: Duration::from_secs(settings.max_utterance_secs as u64),
        }
    }

    fn samples(&self, d: Duration) -> usize {
        (self.sample_rate as u128 * d.as_millis() / 1000) as usize
    }
}

pub struct TranscribingRecognizer {
    microphone: Box<dyn MicrophoneSource>,
    transcriber: Arc<dyn Transcriber>,
    config: StreamingConfig,
    task: Option<JoinHandle<()>>,
}

impl TranscribingRecognizer {
    pub fn new(microphone: Box<dyn MicrophoneSource>, transcriber: Arc<dyn Transcriber>, config: StreamingConfig) -> Self {
        Self {
            microphone,
            transcriber,
            config,
            task: None,
        }
    }
}

impl SpeechRecognizer for TranscribingRecognizer {
    fn start(&mut self, results: ResultSender) -> Result<(), CallError> {
        self.stop();

        let (tx, rx) = mpsc::unbounded_channel();
        let frames = FrameSender::new(results.epoch(), move |frame| tx.send(frame.samples).is_ok());
        self.microphone.start(frames)?;

        let task = tokio::spawn(recognize(rx, self.transcriber.clone(), self.config, results));
        self.task = Some(task);
        log::info!("✓ Speech recognizer started");
        Ok(())
    }

    fn stop(&mut self) {
        self.microphone.stop();
        if let Some(task) = self.task.take() {
            task.abort();
            log::debug!("Speech recognizer stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for TranscribingRecognizer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn recognize(
    mut frames: mpsc::UnboundedReceiver<Vec<f32>>,
    transcriber: Arc<dyn Transcriber>,
    config: StreamingConfig,
    results: ResultSender,
) {
    let window = config.samples(config.window).max(1);
    let max_samples = config.samples(config.max_utterance);
    let mut audio: Vec<f32> = Vec::new();
    let mut unheard = 0;
    let mut hypothesis = String::new();

    while let Some(samples) = frames.recv().await {
        if audio.is_empty() && calculate_rms_energy(&samples) <= config.threshold {
            continue;
        }
        unheard += samples.len();
        audio.extend(samples);
        if unheard < window {
            continue;
        }
        unheard = 0;

        match transcriber.transcribe(audio.clone(), config.sample_rate).await {
            Ok(text) => {
                let text = text.trim().to_string();
                if !text.is_empty() && text != hypothesis {
                    hypothesis = text.clone();
                    if !results.send(RecognizerEvent::Interim(text)) {
                        return;
                    }
                }
            }
            Err(e) => log::debug!("No hypothesis for {} samples: {}", audio.len(), e),
        }

        if audio.len() >= max_samples {
            log::warn!("Recognizer utterance hit {:?} - reporting final", config.max_utterance);
            if !results.send(RecognizerEvent::Final(std::mem::take(&mut hypothesis))) {
                return;
            }
            audio.clear();
        }
    }
}
