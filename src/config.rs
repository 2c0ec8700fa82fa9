//! Call settings
//!
//! Settings are read from `<config dir>/companion-call/settings.json` when the
//! file exists, then `CALL_API_BASE_URL` / `CALL_API_TOKEN` from the environment
//! override the backend origin and bearer token.

use crate::error::{CallError, IntoCallError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_DIR: &str = "companion-call";
const SETTINGS_FILE: &str = "settings.json";

const ENV_API_BASE_URL: &str = "CALL_API_BASE_URL";
const ENV_API_TOKEN: &str = "CALL_API_TOKEN";

/// How the voice pipeline decides where an utterance ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStrategy {
    /// RMS energy threshold plus a silence deadline on the audio clock
    Energy,
    /// Interim/final results from a streaming recognizer plus a pause deadline
    Recognizer,
}

/// What a finalized audio utterance turns into on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundAudio {
    /// Send the encoded utterance as `audio_input`
    Forward,
    /// Run the local transcriber and send `text_input`
    Transcribe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    pub api_base_url: String,       // Backend HTTP(S) origin (e.g., "https://api.example.com")
    pub api_token: Option<String>,  // Optional bearer token for REST calls
    pub language: String,           // Recognition language sent with start_listening
    pub sample_rate: u32,           // Capture sample rate in Hz
    pub capture_strategy: CaptureStrategy,
    pub vad_sensitivity: f32,       // RMS energy threshold (0.0-1.0)
    pub silence_timeout_ms: u32,    // Sub-threshold audio before an energy utterance ends
    pub recognizer_pause_ms: u32,   // Pause without interim delta before a recognizer utterance ends
    pub min_speech_ms: u32,         // Shorter voiced audio is dropped locally
    pub max_utterance_secs: u32,    // Utterances are force-finalized at this length
    pub connect_timeout_ms: u64,    // Transport open timeout
    pub reconnect_attempts: u32,    // 0 disables reconnection
    pub reconnect_backoff_ms: u64,  // Linear backoff step between reconnect attempts
    pub outbound_audio: OutboundAudio,
    pub whisper_model_path: Option<PathBuf>,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            api_token: None,
            language: "ko-KR".to_string(),
            sample_rate: 16000,
            capture_strategy: CaptureStrategy::Energy,
            vad_sensitivity: 0.02,
            silence_timeout_ms: 2000,
            recognizer_pause_ms: 1500,
            min_speech_ms: 250,
            max_utterance_secs: 30,
            connect_timeout_ms: 10_000,
            reconnect_attempts: 0,
            reconnect_backoff_ms: 1000,
            outbound_audio: OutboundAudio::Forward,
            whisper_model_path: None,
        }
    }
}

impl CallSettings {
    /// Default settings file location
    pub fn default_path() -> Result<PathBuf, CallError> {
        let base = dirs::config_dir()
            .ok_or_else(|| CallError::Config("No user config directory available".to_string()))?;
        Ok(base.join(SETTINGS_DIR).join(SETTINGS_FILE))
    }

    /// Load settings from the default location, then apply environment overrides
    pub fn load() -> Result<Self, CallError> {
        let path = Self::default_path()?;
        let mut settings = Self::load_from(&path)?;
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a file; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self, CallError> {
        if !path.exists() {
            log::info!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let settings: CallSettings = serde_json::from_str(&raw)?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self) -> Result<(), CallError> {
        self.validate()?;
        self.save_to(&Self::default_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), CallError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        log::info!("✓ Settings saved to {}", path.display());
        Ok(())
    }

    /// Apply `CALL_API_BASE_URL` / `CALL_API_TOKEN` overrides from a lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_BASE_URL).filter(|v| !v.trim().is_empty()) {
            log::debug!("{} overrides api_base_url", ENV_API_BASE_URL);
            self.api_base_url = url.trim().to_string();
        }
        if let Some(token) = lookup(ENV_API_TOKEN).filter(|v| !v.trim().is_empty()) {
            self.api_token = Some(token.trim().to_string());
        }
    }

    pub fn validate(&self) -> Result<(), CallError> {
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(CallError::Config(format!(
                "Invalid API Base URL: '{}'. Must start with http:// or https://",
                self.api_base_url
            )));
        }

        if !(0.001..=1.0).contains(&self.vad_sensitivity) {
            return Err(CallError::Config(format!(
                "Invalid sensitivity: {}. Must be between 0.001 and 1.0",
                self.vad_sensitivity
            )));
        }

        if !(100..=10000).contains(&self.silence_timeout_ms) {
            return Err(CallError::Config(format!(
                "Invalid silence timeout: {}ms. Must be between 100ms and 10000ms",
                self.silence_timeout_ms
            )));
        }

        if !(1500..=2000).contains(&self.recognizer_pause_ms) {
            return Err(CallError::Config(format!(
                "Invalid recognizer pause: {}ms. Must be between 1500ms and 2000ms",
                self.recognizer_pause_ms
            )));
        }

        if !(8000..=48000).contains(&self.sample_rate) {
            return Err(CallError::Config(format!(
                "Invalid sample rate: {}Hz. Must be between 8000Hz and 48000Hz",
                self.sample_rate
            )));
        }

        if self.max_utterance_secs == 0 {
            return Err(CallError::Config("max_utterance_secs must be positive".to_string()));
        }

        if self.connect_timeout_ms == 0 {
            return Err(CallError::Config("connect_timeout_ms must be positive".to_string()));
        }

        url::Url::parse(&self.api_base_url).map_call_err(CallError::Config)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn recognizer_pause(&self) -> Duration {
        Duration::from_millis(self.recognizer_pause_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let settings = CallSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.silence_timeout_ms, 2000);
        assert_eq!(settings.connect_timeout(), Duration::from_secs(10));
        assert_eq!(settings.reconnect_attempts, 0);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = CallSettings::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, CallSettings::default());
    }

    #[test]
    fn test_save_and_load_round_trip_with_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = CallSettings::default();
        settings.language = "en-US".to_string();
        settings.capture_strategy = CaptureStrategy::Recognizer;
        settings.save_to(&path).unwrap();

        let loaded = CallSettings::load_from(&path).unwrap();
        assert_eq!(loaded.language, "en-US");
        assert_eq!(loaded.capture_strategy, CaptureStrategy::Recognizer);

        std::fs::write(&path, r#"{ "vad_sensitivity": 0.05 }"#).unwrap();
        let partial = CallSettings::load_from(&path).unwrap();
        assert_eq!(partial.vad_sensitivity, 0.05);
        assert_eq!(partial.sample_rate, 16000);
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = CallSettings::default();
        settings.apply_env_overrides(|key| match key {
            "CALL_API_BASE_URL" => Some(" https://calls.example.com ".to_string()),
            "CALL_API_TOKEN" => Some("secret".to_string()),
            _ => None,
        });
        assert_eq!(settings.api_base_url, "https://calls.example.com");
        assert_eq!(settings.api_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_validation_rejects_out_of_range_values() {
        let mut settings = CallSettings::default();
        settings.vad_sensitivity = 2.0;
        assert!(matches!(settings.validate(), Err(CallError::Config(_))));

        let mut settings = CallSettings::default();
        settings.api_base_url = "ftp://example.com".to_string();
        assert!(settings.validate().is_err());

        let mut settings = CallSettings::default();
        settings.recognizer_pause_ms = 500;
        assert!(settings.validate().is_err());

        let mut settings = CallSettings::default();
        settings.sample_rate = 4000;
        assert!(settings.validate().is_err());
    }
}
