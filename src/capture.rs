//! Microphone capture
//!
//! - `MicrophoneSource`: a startable/stoppable input that pushes mono f32 frames
//! - `FrameSender`: where a running source delivers frames, tagged with the
//!   capture epoch it was started under
//! - `CaptureManager`: explicit microphone ownership. Exactly one holder at a
//!   time; acquiring preempts the previous holder, whose lease reports revoked.
//! - `CpalMicrophone` (feature `native-audio`): the default input device via cpal

use crate::error::CallError;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Incremented every time capture starts; frames from older epochs are stale
pub type CaptureEpoch = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub epoch: CaptureEpoch,
    pub samples: Vec<f32>,
}

type FrameFn = dyn Fn(AudioFrame) -> bool + Send + Sync;

/// Frame delivery handle given to a microphone when it starts
#[derive(Clone)]
pub struct FrameSender {
    epoch: CaptureEpoch,
    deliver: Arc<FrameFn>,
}

impl FrameSender {
    pub fn new<F>(epoch: CaptureEpoch, deliver: F) -> Self
    where
        F: Fn(AudioFrame) -> bool + Send + Sync + 'static,
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
    pub fn send(&self, samples: Vec<f32>) -> bool {
        (self.deliver)(AudioFrame {
            epoch: self.epoch,
            samples,
        })
    }
}

impl std::fmt::Debug for FrameSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSender").field("epoch", &self.epoch).finish()
    }
}

/// A physical (or simulated) microphone
pub trait MicrophoneSource: Send {
    /// Begin delivering frames; fails with `MicrophoneDenied` when access is refused
    fn start(&mut self, frames: FrameSender) -> Result<(), CallError>;

    /// Stop delivering frames and release the device. Idempotent.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

// =========================================================================
// Capture manager
// =========================================================================

struct Holder {
    id: u64,
    owner: String,
    revoke: watch::Sender<bool>,
}

#[derive(Default)]
struct Ownership {
    next_id: u64,
    holder: Option<Holder>,
}

/// Arbitrates which component may use the microphone
#[derive(Clone, Default)]
pub struct CaptureManager {
    inner: Arc<Mutex<Ownership>>,
}

impl CaptureManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the microphone, preempting the current holder if there is one
    pub fn acquire(&self, owner: impl Into<String>) -> CaptureLease {
        let owner = owner.into();
        let mut ownership = self.lock();

        if let Some(previous) = ownership.holder.take() {
            log::info!("Microphone preempted: {} -> {}", previous.owner, owner);
            previous.revoke.send_replace(true);
        } else {
            log::debug!("Microphone acquired by {}", owner);
        }

        ownership.next_id += 1;
        let id = ownership.next_id;
        let (revoke, revoked) = watch::channel(false);
        ownership.holder = Some(Holder {
            id,
            owner: owner.clone(),
            revoke,
        });

        CaptureLease {
            id,
            owner,
            revoked,
            manager: self.clone(),
        }
    }

    /// Current holder, if any
    pub fn holder(&self) -> Option<String> {
        self.lock().holder.as_ref().map(|h| h.owner.clone())
    }

    fn release(&self, id: u64) -> bool {
        let mut ownership = self.lock();
        match &ownership.holder {
            Some(holder) if holder.id == id => {
                log::debug!("Microphone released by {}", holder.owner);
                ownership.holder = None;
                true
            }
            _ => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ownership> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Proof of microphone ownership; released on drop
pub struct CaptureLease {
    id: u64,
    owner: String,
    revoked: watch::Receiver<bool>,
    manager: CaptureManager,
}

impl CaptureLease {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_revoked(&self) -> bool {
        *self.revoked.borrow()
    }

    /// Resolves once another owner has taken the microphone
    pub async fn revoked(&mut self) {
        // A dropped sender without a revocation means the manager released us normally
        let _ = self.revoked.wait_for(|revoked| *revoked).await;
    }

    pub fn release(self) {
        // Drop does the work
    }
}

impl Drop for CaptureLease {
    fn drop(&mut self) {
        self.manager.release(self.id);
    }
}

// =========================================================================
// cpal microphone
// =========================================================================

/// Run a blocking wait without stalling other tasks on a multi-thread runtime
#[cfg_attr(not(feature = "native-audio"), allow(dead_code))]
fn off_runtime<T>(wait: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(wait)
        }
        _ => wait(),
    }
}

#[cfg(feature = "native-audio")]
pub use native::CpalMicrophone;

#[cfg(feature = "native-audio")]
mod native {
    use super::{off_runtime, FrameSender, MicrophoneSource};
    use crate::error::CallError;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::StreamConfig;
    use std::sync::mpsc;
    use std::thread::JoinHandle;

    const CHANNELS: u16 = 1; // Mono
    const CHUNK_SIZE: u32 = 512; // 32ms at 16kHz

    /// Default input device, captured on a dedicated thread
    ///
    /// cpal streams are not `Send` on every platform, so the stream lives on
    /// its own thread for as long as capture runs.
    pub struct CpalMicrophone {
        sample_rate: u32,
        running: Option<Running>,
    }

    struct Running {
        stop_tx: mpsc::Sender<()>,
        thread: JoinHandle<()>,
    }

    impl CpalMicrophone {
        pub fn new(sample_rate: u32) -> Self {
            Self {
                sample_rate,
                running: None,
            }
        }
    }

    impl MicrophoneSource for CpalMicrophone {
        fn start(&mut self, frames: FrameSender) -> Result<(), CallError> {
            if self.running.is_some() {
                self.stop();
            }

            let sample_rate = self.sample_rate;
            let (ready_tx, ready_rx) = mpsc::channel::<Result<(), CallError>>();
            let (stop_tx, stop_rx) = mpsc::channel::<()>();

            let thread = std::thread::spawn(move || {
                let stream = match open_stream(sample_rate, frames) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive until stop() (or the owner is dropped)
                let _ = stop_rx.recv();
                stream.pause().ok();
                drop(stream);
                log::debug!("Audio capture thread stopped");
            });

            match off_runtime(|| ready_rx.recv()) {
                Ok(Ok(())) => {
                    self.running = Some(Running { stop_tx, thread });
                    log::info!("✓ Audio stream started ({}Hz mono)", sample_rate);
                    Ok(())
                }
                Ok(Err(e)) => {
                    let _ = off_runtime(|| thread.join());
                    Err(e)
                }
                Err(_) => Err(CallError::Microphone(
                    "audio capture thread exited during start".to_string(),
                )),
            }
        }

        fn stop(&mut self) {
            if let Some(running) = self.running.take() {
                let _ = running.stop_tx.send(());
                if off_runtime(|| running.thread.join()).is_err() {
                    log::error!("Audio capture thread panicked");
                }
                log::info!("Audio stream stopped");
            }
        }

        fn is_running(&self) -> bool {
            self.running.is_some()
        }
    }

    impl Drop for CpalMicrophone {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn open_stream(sample_rate: u32, frames: FrameSender) -> Result<cpal::Stream, CallError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| CallError::Microphone("No input device available".to_string()))?;

        log::info!("Audio device: {}", device.name().unwrap_or_default());

        let config = StreamConfig {
            channels: CHANNELS,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Fixed(CHUNK_SIZE),
        };

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    frames.send(data.to_vec());
                },
                move |err| {
                    log::error!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(classify_build_error)?;

        stream
            .play()
            .map_err(|e| CallError::Microphone(format!("Failed to play stream: {}", e)))?;

        Ok(stream)
    }

    fn classify_build_error(err: cpal::BuildStreamError) -> CallError {
        let message = err.to_string();
        let lowered = message.to_lowercase();
        if lowered.contains("permission") || lowered.contains("denied") || lowered.contains("not authorized") {
            CallError::MicrophoneDenied(message)
        } else {
            CallError::Microphone(format!("Failed to build input stream: {}", message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_frame_sender_tags_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = FrameSender::new(7, move |frame| tx.send(frame).is_ok());

        assert!(sender.send(vec![0.1, 0.2]));
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.epoch, 7);
        assert_eq!(frame.samples, vec![0.1, 0.2]);

        drop(rx);
        assert!(!sender.send(vec![0.3]));
    }

    #[test]
    fn test_acquire_preempts_previous_holder() {
        let manager = CaptureManager::new();
        let dictation = manager.acquire("dictation");
        assert_eq!(manager.holder().as_deref(), Some("dictation"));
        assert!(!dictation.is_revoked());

        let call = manager.acquire("call");
        assert!(dictation.is_revoked());
        assert!(!call.is_revoked());
        assert_eq!(manager.holder().as_deref(), Some("call"));

        // A preempted lease must not release the new holder
        drop(dictation);
        assert_eq!(manager.holder().as_deref(), Some("call"));

        call.release();
        assert_eq!(manager.holder(), None);
    }

    #[tokio::test]
    async fn test_revoked_resolves_on_preemption() {
        let manager = CaptureManager::new();
        let mut first = manager.acquire("first");

        let waiter = tokio::spawn(async move {
            first.revoked().await;
            first.is_revoked()
        });
        tokio::task::yield_now().await;

        let _second = manager.acquire("second");
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_blocking_wait_leaves_the_worker_free() {
        let (tx, rx) = std::sync::mpsc::channel();

        // Blocks the only worker until the second task runs on it
        let waiter = tokio::spawn(async move { off_runtime(|| rx.recv()) });
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(42).unwrap();
        });

        let got = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(got, Ok(42));
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_blocking_wait_runs_inline_on_current_thread_runtime() {
        assert_eq!(off_runtime(|| 7), 7);
    }
}
