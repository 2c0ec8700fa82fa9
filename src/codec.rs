//! Transport audio format
//!
//! Outbound utterances travel as base64 WAV (mono PCM16). Inbound AI audio is
//! base64 of whatever the voice backend produced (WAV, MP3 or Ogg), optionally
//! wrapped in a `data:` URL. Decoding only unwraps and sniffs the container;
//! the playback sink does the actual decoding.

use crate::error::{CallError, IntoCallError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::io::Cursor;

/// Wire name of the outbound audio format
pub const TRANSPORT_FORMAT: &str = "wav";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
    Ogg,
    Unknown,
}

impl AudioFormat {
    /// Guess the container from the first bytes
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
            AudioFormat::Wav
        } else if bytes.starts_with(b"OggS") {
            AudioFormat::Ogg
        } else if bytes.starts_with(b"ID3") || (bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0) {
            AudioFormat::Mp3
        } else {
            AudioFormat::Unknown
        }
    }
}

/// Audio ready to hand to a playback sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayableAudio {
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
}

impl PlayableAudio {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CallError> {
        if bytes.is_empty() {
            return Err(CallError::Codec("empty audio payload".to_string()));
        }
        let format = AudioFormat::sniff(&bytes);
        Ok(Self { bytes, format })
    }
}

/// Encode mono f32 samples as a base64 PCM16 WAV
pub fn encode_to_transport_format(samples: &[f32], sample_rate: u32) -> Result<String, CallError> {
    if samples.is_empty() {
        return Err(CallError::Codec("no samples to encode".to_string()));
    }

    let mut wav_buffer = Cursor::new(Vec::new());
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::new(&mut wav_buffer, spec)
        .map_call_err(|e| CallError::Codec(format!("Failed to create WAV writer: {}", e)))?;

    for &sample in samples {
        let pcm = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer
            .write_sample(pcm)
            .map_call_err(|e| CallError::Codec(format!("Failed to write WAV sample: {}", e)))?;
    }

    writer
        .finalize()
        .map_call_err(|e| CallError::Codec(format!("Failed to finalize WAV: {}", e)))?;

    Ok(STANDARD.encode(wav_buffer.into_inner()))
}

/// Decode an inbound base64 audio payload
pub fn decode_from_transport_format(payload: &str) -> Result<PlayableAudio, CallError> {
    let payload = payload.trim();
    // data:audio/mpeg;base64,....
    let payload = match payload.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| CallError::Codec("data URL without payload".to_string()))?,
        None => payload,
    };

    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(cleaned.as_bytes())
        .map_call_err(|e| CallError::Codec(format!("Invalid base64 audio: {}", e)))?;

    PlayableAudio::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_wav_is_pcm16_mono() {
        let samples = vec![0.0, 0.5, -0.5, 1.5, -2.0];
        let payload = encode_to_transport_format(&samples, 16000).unwrap();

        let bytes = STANDARD.decode(payload).unwrap();
        let mut reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(spec.bits_per_sample, 16);

        let pcm: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(pcm, vec![0, 16383, -16383, i16::MAX, -i16::MAX]);
    }

    #[test]
    fn test_encode_rejects_empty_input() {
        assert!(matches!(
            encode_to_transport_format(&[], 16000),
            Err(CallError::Codec(_))
        ));
    }

    #[test]
    fn test_decode_sniffs_format_and_unwraps_data_urls() {
        let wav = encode_to_transport_format(&[0.1; 64], 16000).unwrap();
        assert_eq!(decode_from_transport_format(&wav).unwrap().format, AudioFormat::Wav);

        let mp3 = STANDARD.encode(b"ID3\x04\x00\x00\x00\x00\x00\x00");
        let audio = decode_from_transport_format(&format!("data:audio/mpeg;base64,{}", mp3)).unwrap();
        assert_eq!(audio.format, AudioFormat::Mp3);

        let ogg = STANDARD.encode(b"OggS\x00\x02");
        assert_eq!(decode_from_transport_format(&ogg).unwrap().format, AudioFormat::Ogg);
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert!(decode_from_transport_format("").is_err());
        assert!(decode_from_transport_format("%%%not base64%%%").is_err());
        assert!(decode_from_transport_format("data:audio/mpeg;base64").is_err());
    }
}
