//! Microphone capture pipeline
//!
//! Runs on a dedicated OS thread: reads fixed-size blocks from the device,
//! encodes each one to PCM16 and offers it to the session. Blocks the
//! transport cannot take right now are dropped, never queued.

use crate::codec;
use crate::error::{LiveError, Result};
use crate::protocol::ClientMessage;
use crate::session::link::{Offer, SessionLink};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// An opened input device producing mono `f32` samples.
pub trait MicrophoneStream {
    /// Fill `block` completely, blocking until the samples are available.
    fn read_block(&mut self, block: &mut [f32]) -> anyhow::Result<()>;
}

/// Factory for input devices. `open` runs on the capture thread, so streams
/// need not be `Send`.
pub trait MicrophoneSource: Send + Sync + 'static {
    fn open(&self, sample_rate: u32) -> anyhow::Result<Box<dyn MicrophoneStream>>;
}

#[derive(Debug, Default)]
pub struct CaptureStats {
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
}

/// A running capture thread bound to one session.
#[derive(Debug)]
pub struct CapturePipeline {
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
}

impl CapturePipeline {
    /// Acquire the microphone and start streaming into `link`.
    ///
    /// Blocks until the device is open; a device that cannot be opened yields
    /// [`LiveError::MediaDevice`].
    pub fn start(source: Arc<dyn MicrophoneSource>, link: SessionLink, block_samples: usize) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(CaptureStats::default());
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<std::result::Result<(), String>>(1);

        let thread_running = running.clone();
        let thread_stats = stats.clone();
        std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match source.open(codec::INPUT_SAMPLE_RATE) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        thread_running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(format!("{:#}", e)));
                        return;
                    }
                };
                capture_loop(stream, link, block_samples.max(1), &thread_running, &thread_stats);
                thread_running.store(false, Ordering::SeqCst);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(
                    "Microphone capture started at {}Hz, {} samples per block",
                    codec::INPUT_SAMPLE_RATE,
                    block_samples
                );
                Ok(Self { running, stats })
            }
            Ok(Err(message)) => Err(LiveError::MediaDevice(message)),
            Err(_) => Err(LiveError::MediaDevice("capture thread exited during startup".to_string())),
        }
    }

    /// Signal the capture thread to exit after its current block. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(
                "Microphone capture stopped ({} frames sent, {} dropped)",
                self.stats.sent.load(Ordering::Relaxed),
                self.stats.dropped.load(Ordering::Relaxed)
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn frames_sent(&self) -> u64 {
        self.stats.sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn capture_loop(
    mut stream: Box<dyn MicrophoneStream>,
    link: SessionLink,
    block_samples: usize,
    running: &AtomicBool,
    stats: &CaptureStats,
) {
    let mut block = vec![0.0f32; block_samples];
    while running.load(Ordering::SeqCst) {
        if let Err(e) = stream.read_block(&mut block) {
            error!("Microphone read failed: {:#}", e);
            break;
        }
        // Stop may have been requested while the read was blocked.
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let pcm = codec::f32_to_pcm16(&block);
        match link.offer(ClientMessage::audio(&pcm)) {
            Offer::Sent => {
                stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            Offer::Dropped => {
                let dropped = stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 50 == 1 {
                    debug!("Transport busy, dropped {} microphone frame(s) so far", dropped);
                }
            }
            Offer::Detached => {
                warn!("Session gone, stopping microphone capture");
                break;
            }
        }
    }
}
