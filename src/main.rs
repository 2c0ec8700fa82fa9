use companion_call::capture::CpalMicrophone;
use companion_call::bridge::Transcriber;
use companion_call::playback::RodioSink;
use companion_call::recognizer::{SpeechRecognizer, StreamingConfig, TranscribingRecognizer};
use companion_call::{
    init_logging, start_call, CallDeps, CallError, CallSettings, CaptureManager, CaptureStrategy, CharacterRef,
    HttpCallBackend,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

// Usage: companion-call [CHARACTER_ID] [CHARACTER_NAME]
//
// While the call runs, type `m` + Enter to toggle mute, `f` to send the
// current utterance now, `q` (or Ctrl-C) to hang up.
#[tokio::main]
async fn main() {
    init_logging();

    if let Err(e) = run().await {
        log::error!("✗ {}", e);
        eprintln!("{}", e.user_message());
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CallError> {
    let settings = CallSettings::load()?;

    let mut args = std::env::args().skip(1);
    let character = CharacterRef {
        id: args.next(),
        name: args.next(),
    };

    let backend = HttpCallBackend::from_settings(&settings)?;
    let http = backend.client().clone();
    let transcriber = load_transcriber(&settings)?;
    let deps = CallDeps {
        backend: Arc::new(backend),
        microphone: Box::new(CpalMicrophone::new(settings.sample_rate)),
        recognizer: build_recognizer(&settings, transcriber.as_ref()),
        sink: Box::new(RodioSink::new()),
        transcriber,
        capture: CaptureManager::new(),
        http,
    };

    let handle = start_call(settings, character, deps).await?;
    let who = handle.session().character_name.clone().unwrap_or_else(|| "companion".to_string());
    println!("Connected to {}. [m] mute  [f] send now  [q] hang up", who);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut muted = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                handle.end();
                break;
            }
            _ = handle.closed() => break,
            line = stdin.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "m" => {
                        muted = !muted;
                        handle.set_muted(muted);
                        println!("{}", if muted { "Muted" } else { "Unmuted" });
                    }
                    "f" => {
                        handle.finish_utterance();
                    }
                    "q" => {
                        handle.end();
                        break;
                    }
                    _ => {}
                },
                // stdin closed; keep the call running until hang-up
                Ok(None) | Err(_) => {
                    handle.closed().await;
                    break;
                }
            },
        }
    }

    let summary = handle.join().await?;
    println!("Call {} ({})", summary.reason, summary.formatted_duration());
    if let Some(message) = summary.reason.user_message() {
        eprintln!("{}", message);
    }
    Ok(())
}

/// Local streaming recognition on top of the transcriber, for the recognizer strategy
fn build_recognizer(
    settings: &CallSettings,
    transcriber: Option<&Arc<dyn Transcriber>>,
) -> Option<Box<dyn SpeechRecognizer>> {
    if settings.capture_strategy != CaptureStrategy::Recognizer {
        return None;
    }
    let Some(transcriber) = transcriber else {
        log::warn!("Recognizer capture needs whisper_model_path");
        return None;
    };
    Some(Box::new(TranscribingRecognizer::new(
        Box::new(CpalMicrophone::new(settings.sample_rate)),
        transcriber.clone(),
        StreamingConfig::from_settings(settings),
    )))
}

#[cfg(feature = "whisper")]
fn load_transcriber(settings: &CallSettings) -> Result<Option<Arc<dyn Transcriber>>, CallError> {
    match &settings.whisper_model_path {
        Some(path) => {
            let transcriber = companion_call::whisper::WhisperTranscriber::new(path, &settings.language)?;
            Ok(Some(Arc::new(transcriber)))
        }
        None => Ok(None),
    }
}

#[cfg(not(feature = "whisper"))]
fn load_transcriber(_settings: &CallSettings) -> Result<Option<Arc<dyn Transcriber>>, CallError> {
    Ok(None)
}
