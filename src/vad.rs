//! Voice Activity Pipeline
//!
//! Turns a live input into discrete utterances without push-to-talk. Two
//! strategies are available and exactly one is used per call:
//!
//! - Energy: RMS energy of each captured frame against a threshold. Recording
//!   opens on the first voiced frame; a silence deadline measured on the audio
//!   sample clock is re-armed on every voiced frame and finalizes the utterance
//!   when it elapses.
//! - Recognizer: interim/final results of a streaming recognizer. A pause with
//!   no new interim delta finalizes the accumulated text; a final result
//!   finalizes immediately.
//!
//! Both share one contract: a single finalize path fires per utterance, nothing
//! opens while the pipeline is closed or muted, and cancellation discards the
//! partial utterance.

use crate::config::{CallSettings, CaptureStrategy};
use crate::timer::TimerSlot;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

pub type UtteranceId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum UtteranceContent {
    Audio { samples: Vec<f32>, sample_rate: u32 },
    Text(String),
}

/// What ended an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeCause {
    Silence,
    Pause,
    FinalResult,
    Manual,
    MaxLength,
}

/// One finalized segment of user speech
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: UtteranceId,
    pub started_at: DateTime<Utc>,
    pub cause: FinalizeCause,
    pub content: UtteranceContent,
}

struct Segment {
    started_at: DateTime<Utc>,
    cause: FinalizeCause,
    content: UtteranceContent,
}

/// Calculate RMS energy of audio samples
pub fn calculate_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

// =========================================================================
// Energy strategy
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyVadConfig {
    pub threshold: f32,
    pub sample_rate: u32,
    pub silence_timeout_ms: u32,
    pub min_speech_ms: u32,
    pub max_utterance_secs: u32,
}

impl EnergyVadConfig {
    pub fn from_settings(settings: &CallSettings) -> Self {
        Self {
            threshold: settings.vad_sensitivity,
            sample_rate: settings.sample_rate,
            silence_timeout_ms: settings.silence_timeout_ms,
            min_speech_ms: settings.min_speech_ms,
            max_utterance_secs: settings.max_utterance_secs,
        }
    }

    fn ms_to_samples(&self, ms: u32) -> u64 {
        self.sample_rate as u64 * ms as u64 / 1000
    }
}

struct Recording {
    started_at: DateTime<Utc>,
    samples: Vec<f32>,
    voiced_len: usize,     // buffer length right after the last voiced frame
    voiced_samples: u64,   // total voiced audio, for the minimum-speech check
}

pub struct EnergySegmenter {
    config: EnergyVadConfig,
    clock: u64, // samples observed, the clock silence deadlines run on
    recording: Option<Recording>,
    silence: TimerSlot<u64>,
}

impl EnergySegmenter {
    pub fn new(config: EnergyVadConfig) -> Self {
        Self {
            config,
            clock: 0,
            recording: None,
            silence: TimerSlot::new(),
        }
    }

    fn push_frame(&mut self, frame: &[f32]) -> Option<Segment> {
        if frame.is_empty() {
            return None;
        }

        self.clock += frame.len() as u64;
        let energy = calculate_rms_energy(frame);
        let voiced = energy > self.config.threshold;
        let silence_deadline = self.clock + self.config.ms_to_samples(self.config.silence_timeout_ms);
        let max_samples = self.config.sample_rate as usize * self.config.max_utterance_secs as usize;

        let recording = match self.recording.as_mut() {
            Some(recording) => recording,
            None => {
                if voiced {
                    log::debug!(
                        "Speech detected! (energy: {:.4} > threshold: {:.4})",
                        energy, self.config.threshold
                    );
                    self.recording = Some(Recording {
                        started_at: Utc::now(),
                        samples: frame.to_vec(),
                        voiced_len: frame.len(),
                        voiced_samples: frame.len() as u64,
                    });
                    self.silence.arm(silence_deadline);
                }
                return None;
            }
        };

        recording.samples.extend_from_slice(frame);
        if voiced {
            recording.voiced_len = recording.samples.len();
            recording.voiced_samples += frame.len() as u64;
            self.silence.arm(silence_deadline);
        }
        let too_long = recording.samples.len() >= max_samples;

        if self.silence.fire_if_due(self.clock).is_some() {
            log::debug!("Silence detected after speech - ending recording");
            return self.finalize(FinalizeCause::Silence);
        }
        if too_long {
            log::warn!("Recording hit {}s limit - ending recording", self.config.max_utterance_secs);
            return self.finalize(FinalizeCause::MaxLength);
        }
        None
    }

    fn finalize(&mut self, cause: FinalizeCause) -> Option<Segment> {
        self.silence.disarm();
        let recording = self.recording.take()?;

        let voiced_ms = recording.voiced_samples * 1000 / self.config.sample_rate as u64;
        if voiced_ms < self.config.min_speech_ms as u64 {
            log::debug!(
                "Discarding utterance with {}ms of speech (minimum {}ms)",
                voiced_ms, self.config.min_speech_ms
            );
            return None;
        }

        let mut samples = recording.samples;
        // Trailing sub-threshold audio is not part of the utterance
        samples.truncate(recording.voiced_len);

        Some(Segment {
            started_at: recording.started_at,
            cause,
            content: UtteranceContent::Audio {
                samples,
                sample_rate: self.config.sample_rate,
            },
        })
    }

    fn cancel(&mut self) -> bool {
        self.silence.disarm();
        self.recording.take().is_some()
    }

    fn has_open(&self) -> bool {
        self.recording.is_some()
    }
}

// =========================================================================
// Recognizer strategy
// =========================================================================

/// Result stream of a live speech recognizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// The recognizer's current hypothesis for the whole utterance so far
    Interim(String),
    Final(String),
}

struct Transcript {
    started_at: DateTime<Utc>,
    text: String,
}

pub struct RecognizerSegmenter {
    pause: Duration,
    transcript: Option<Transcript>,
    deadline: TimerSlot<Instant>,
}

impl RecognizerSegmenter {
    pub fn new(pause: Duration) -> Self {
        Self {
            pause,
            transcript: None,
            deadline: TimerSlot::new(),
        }
    }

    fn push_event(&mut self, event: RecognizerEvent, now: Instant) -> Option<Segment> {
        match event {
            RecognizerEvent::Interim(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return None;
                }
                match self.transcript.as_mut() {
                    Some(transcript) if transcript.text == text => {
                        // No new delta; the pause keeps running
                    }
                    Some(transcript) => {
                        transcript.text = text.to_string();
                        self.deadline.arm(now + self.pause);
                    }
                    None => {
                        self.transcript = Some(Transcript {
                            started_at: Utc::now(),
                            text: text.to_string(),
                        });
                        self.deadline.arm(now + self.pause);
                    }
                }
                None
            }
            RecognizerEvent::Final(text) => {
                let text = text.trim().to_string();
                if !text.is_empty() {
                    let transcript = self.transcript.get_or_insert_with(|| Transcript {
                        started_at: Utc::now(),
                        text: String::new(),
                    });
                    transcript.text = text;
                }
                self.finalize(FinalizeCause::FinalResult)
            }
        }
    }

    fn on_deadline(&mut self, now: Instant) -> Option<Segment> {
        self.deadline.fire_if_due(now)?;
        log::debug!("No new interim result for {:?} - ending utterance", self.pause);
        self.finalize(FinalizeCause::Pause)
    }

    fn finalize(&mut self, cause: FinalizeCause) -> Option<Segment> {
        self.deadline.disarm();
        let transcript = self.transcript.take()?;
        if transcript.text.is_empty() {
            return None;
        }
        Some(Segment {
            started_at: transcript.started_at,
            cause,
            content: UtteranceContent::Text(transcript.text),
        })
    }

    fn cancel(&mut self) -> bool {
        self.deadline.disarm();
        self.transcript.take().is_some()
    }

    fn has_open(&self) -> bool {
        self.transcript.is_some()
    }
}

// =========================================================================
// Pipeline
// =========================================================================

enum Segmenter {
    Energy(EnergySegmenter),
    Recognizer(RecognizerSegmenter),
}

/// The voice pipeline of one call
///
/// Opened by the turn controller when the user may speak; closes itself as soon
/// as an utterance is finalized so at most one is in flight.
pub struct VoicePipeline {
    segmenter: Segmenter,
    listening: bool,
    muted: bool,
    next_id: UtteranceId,
}

impl VoicePipeline {
    pub fn energy(config: EnergyVadConfig) -> Self {
        Self::with(Segmenter::Energy(EnergySegmenter::new(config)))
    }

    pub fn recognizer(pause: Duration) -> Self {
        Self::with(Segmenter::Recognizer(RecognizerSegmenter::new(pause)))
    }

    pub fn from_settings(settings: &CallSettings) -> Self {
        match settings.capture_strategy {
            CaptureStrategy::Energy => Self::energy(EnergyVadConfig::from_settings(settings)),
            CaptureStrategy::Recognizer => Self::recognizer(settings.recognizer_pause()),
        }
    }

    fn with(segmenter: Segmenter) -> Self {
        Self {
            segmenter,
            listening: false,
            muted: false,
            next_id: 0,
        }
    }

    pub fn strategy(&self) -> CaptureStrategy {
        match self.segmenter {
            Segmenter::Energy(_) => CaptureStrategy::Energy,
            Segmenter::Recognizer(_) => CaptureStrategy::Recognizer,
        }
    }

    /// Allow a new utterance to open
    pub fn open(&mut self) {
        self.listening = true;
    }

    /// Stop listening and discard any partial utterance; returns whether one was discarded
    pub fn cancel(&mut self) -> bool {
        self.listening = false;
        self.discard()
    }

    /// Mute is a hard gate: muting discards the partial utterance
    pub fn set_muted(&mut self, muted: bool) -> bool {
        self.muted = muted;
        if muted {
            self.discard()
        } else {
            false
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Whether input is currently being turned into utterances
    pub fn is_capturing(&self) -> bool {
        self.listening && !self.muted
    }

    pub fn has_open_utterance(&self) -> bool {
        match &self.segmenter {
            Segmenter::Energy(s) => s.has_open(),
            Segmenter::Recognizer(s) => s.has_open(),
        }
    }

    /// Feed one captured audio frame (energy strategy)
    pub fn push_frame(&mut self, frame: &[f32]) -> Option<Utterance> {
        if !self.is_capturing() {
            return None;
        }
        let segment = match &mut self.segmenter {
            Segmenter::Energy(s) => s.push_frame(frame),
            Segmenter::Recognizer(_) => None,
        }?;
        Some(self.emit(segment))
    }

    /// Feed one recognizer result (recognizer strategy)
    pub fn push_recognizer(&mut self, event: RecognizerEvent, now: Instant) -> Option<Utterance> {
        if !self.is_capturing() {
            return None;
        }
        let segment = match &mut self.segmenter {
            Segmenter::Recognizer(s) => s.push_event(event, now),
            Segmenter::Energy(_) => None,
        }?;
        Some(self.emit(segment))
    }

    /// Wall-clock deadline the owner must wake up for, if any
    pub fn wall_deadline(&self) -> Option<Instant> {
        match &self.segmenter {
            Segmenter::Recognizer(s) => s.deadline.deadline(),
            Segmenter::Energy(_) => None,
        }
    }

    pub fn on_wall_deadline(&mut self, now: Instant) -> Option<Utterance> {
        if !self.is_capturing() {
            return None;
        }
        let segment = match &mut self.segmenter {
            Segmenter::Recognizer(s) => s.on_deadline(now),
            Segmenter::Energy(_) => None,
        }?;
        Some(self.emit(segment))
    }

    /// The user stopped the utterance by hand
    pub fn finish_now(&mut self) -> Option<Utterance> {
        if !self.is_capturing() {
            return None;
        }
        let segment = match &mut self.segmenter {
            Segmenter::Energy(s) => s.finalize(FinalizeCause::Manual),
            Segmenter::Recognizer(s) => s.finalize(FinalizeCause::Manual),
        }?;
        Some(self.emit(segment))
    }

    /// Silence/pause timers currently armed
    pub fn live_timers(&self) -> usize {
        match &self.segmenter {
            Segmenter::Energy(s) => s.silence.live(),
            Segmenter::Recognizer(s) => s.deadline.live(),
        }
    }

    fn discard(&mut self) -> bool {
        let discarded = match &mut self.segmenter {
            Segmenter::Energy(s) => s.cancel(),
            Segmenter::Recognizer(s) => s.cancel(),
        };
        if discarded {
            log::debug!("Discarded partial utterance");
        }
        discarded
    }

    fn emit(&mut self, segment: Segment) -> Utterance {
        self.listening = false;
        self.next_id += 1;
        Utterance {
            id: self.next_id,
            started_at: segment.started_at,
            cause: segment.cause,
            content: segment.content,
        }
    }
}
