//! Local speech-to-text with whisper.cpp
//!
//! Used when `outbound_audio = "transcribe"`: the finalized utterance is turned
//! into text on this machine and sent as `text_input`.

use crate::bridge::Transcriber;
use crate::error::CallError;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

const WHISPER_SAMPLE_RATE: u32 = 16000;

pub struct WhisperTranscriber {
    ctx: Arc<WhisperContext>,
    language: String,
}

impl WhisperTranscriber {
    /// Load the model; `language` is a BCP 47 tag such as `ko-KR`
    pub fn new(model_path: &Path, language: &str) -> Result<Self, CallError> {
        if !model_path.exists() {
            return Err(CallError::Config(format!("Whisper model not found: {:?}", model_path)));
        }
        let path = model_path
            .to_str()
            .ok_or_else(|| CallError::Config(format!("Whisper model path is not UTF-8: {:?}", model_path)))?;

        log::info!("Loading Whisper model from {:?}", model_path);
        let ctx = WhisperContext::new_with_params(path, WhisperContextParameters::default())
            .map_err(|e| CallError::Transcription(format!("Failed to load Whisper model: {}", e)))?;

        // Whisper only wants the primary subtag
        let language = language.split(|c| c == '-' || c == '_').next().unwrap_or("en").to_lowercase();

        Ok(Self {
            ctx: Arc::new(ctx),
            language,
        })
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, samples: Vec<f32>, sample_rate: u32) -> Result<String, CallError> {
        if sample_rate != WHISPER_SAMPLE_RATE {
            return Err(CallError::Transcription(format!(
                "Whisper needs {}Hz audio, got {}Hz",
                WHISPER_SAMPLE_RATE, sample_rate
            )));
        }

        let ctx = self.ctx.clone();
        let language = self.language.clone();
        tokio::task::spawn_blocking(move || transcribe_blocking(&ctx, &language, &samples))
            .await
            .map_err(|e| CallError::Internal(format!("Whisper task failed: {}", e)))?
    }
}

fn transcribe_blocking(ctx: &WhisperContext, language: &str, samples: &[f32]) -> Result<String, CallError> {
    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    params.set_language(Some(language));
    params.set_print_special(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);

    let mut state = ctx
        .create_state()
        .map_err(|e| CallError::Transcription(format!("Failed to create Whisper state: {}", e)))?;

    log::info!("Running Whisper transcription on {} samples...", samples.len());
    state
        .full(params, samples)
        .map_err(|e| CallError::Transcription(format!("Whisper transcription failed: {}", e)))?;

    let num_segments = state.full_n_segments();
    let mut transcription = String::new();
    for i in 0..num_segments {
        if let Some(segment) = state.get_segment(i) {
            let text = segment
                .to_str()
                .map_err(|e| CallError::Transcription(format!("Failed to get segment {} text: {}", i, e)))?;
            transcription.push_str(text);
            transcription.push(' ');
        }
    }

    let transcription = transcription.trim().to_string();
    if transcription.is_empty() {
        log::info!("Whisper returned empty transcription - no speech detected");
        return Err(CallError::Transcription("No speech detected in audio".to_string()));
    }

    log::info!("Transcription complete: '{}'", transcription);
    Ok(transcription)
}
