//! AI audio playback through the default output device (rodio)
//!
//! Each playback runs on its own thread: open the output stream, decode from
//! memory, then poll until the sink drains or `stop()` is requested.

use crate::bridge::{AudioSink, PlaybackCompletion, PlaybackResult};
use crate::codec::PlayableAudio;
use crate::error::{CallError, IntoCallError};
use rodio::{Decoder, OutputStreamBuilder, Sink};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
pub struct RodioSink {
    current: Option<Arc<AtomicBool>>,
}

impl RodioSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioSink for RodioSink {
    fn play(&mut self, audio: PlayableAudio, done: PlaybackCompletion) {
        self.stop();

        let stop = Arc::new(AtomicBool::new(false));
        self.current = Some(stop.clone());

        std::thread::spawn(move || {
            log::debug!("Playing AI audio {} ({:?}, {} bytes)", done.id(), audio.format, audio.bytes.len());
            let result = play_blocking(audio, &stop);
            if let Err(e) = &result {
                log::warn!("AI audio playback failed: {}", e);
            }
            done.complete(result);
        });
    }

    fn stop(&mut self) {
        if let Some(stop) = self.current.take() {
            stop.store(true, Ordering::SeqCst);
        }
    }
}

fn play_blocking(audio: PlayableAudio, stop: &AtomicBool) -> PlaybackResult {
    let stream = OutputStreamBuilder::open_default_stream()
        .map_call_err(|e| CallError::Playback(format!("Failed to open audio output device: {}", e)))?;
    let sink = Sink::connect_new(stream.mixer());

    let source = Decoder::new(Cursor::new(audio.bytes))
        .map_call_err(|e| CallError::Playback(format!("Failed to decode AI audio: {}", e)))?;

    sink.append(source);
    while !sink.empty() {
        if stop.load(Ordering::SeqCst) {
            sink.stop();
            return Err(CallError::Playback("playback stopped".to_string()));
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    log::debug!("Audio playback complete");
    Ok(())
}
