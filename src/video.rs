//! Video frame streamer
//!
//! Samples a video source on a fixed low-frequency timer, downscales the
//! frame to a bounded width, JPEG-encodes it and offers it to the session.
//! Ticks where the source is not ready, or the session is not open, are
//! skipped; nothing is queued or retried.

use crate::config::SessionConfig;
use crate::protocol::ClientMessage;
use crate::session::link::{Offer, SessionLink};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageResult, RgbaImage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const JPEG_MIME_TYPE: &str = "image/jpeg";

/// Something that can hand out the current picture, e.g. a screen or camera.
pub trait VideoSource: Send + Sync + 'static {
    /// Whether a frame can be captured right now.
    fn is_ready(&self) -> bool;

    /// Grab the current frame. May block briefly; called off the async runtime.
    fn capture(&self) -> anyhow::Result<RgbaImage>;
}

#[derive(Debug, Clone, Copy)]
pub struct FrameSettings {
    pub interval: Duration,
    pub max_width: u32,
    pub jpeg_quality: u8,
}

impl From<&SessionConfig> for FrameSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            interval: config.video_interval,
            max_width: config.video_max_width,
            jpeg_quality: config.video_jpeg_quality,
        }
    }
}

/// Downscale to at most `max_width` pixels wide, keeping the aspect ratio, and JPEG-encode.
pub fn encode_frame(frame: &RgbaImage, max_width: u32, quality: u8) -> ImageResult<Vec<u8>> {
    let (width, height) = frame.dimensions();
    let rgba = if width > max_width && max_width > 0 {
        let scaled_height = ((height as u64 * max_width as u64) / width as u64).max(1) as u32;
        image::imageops::resize(frame, max_width, scaled_height, FilterType::Triangle)
    } else {
        frame.clone()
    };

    let rgb = image::DynamicImage::ImageRgba8(rgba).to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(jpeg)
}

/// Periodic sampler bound to one session.
#[derive(Debug)]
pub struct VideoStreamer {
    task: JoinHandle<()>,
    frames_sent: Arc<AtomicU64>,
}

impl VideoStreamer {
    pub fn start(source: Arc<dyn VideoSource>, link: SessionLink, settings: FrameSettings) -> Self {
        info!(
            "Starting video frames every {:?} (max width {}px)",
            settings.interval, settings.max_width
        );
        let frames_sent = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(stream_loop(source, link, settings, frames_sent.clone()));
        Self { task, frames_sent }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Stop sampling. Safe to call repeatedly.
    pub fn stop(&self) {
        if !self.task.is_finished() {
            self.task.abort();
            debug!("Video streamer stopped after {} frame(s)", self.frames_sent());
        }
    }
}

impl Drop for VideoStreamer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn stream_loop(source: Arc<dyn VideoSource>, link: SessionLink, settings: FrameSettings, sent: Arc<AtomicU64>) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        if !link.is_open() {
            debug!("Session not open, skipping video tick");
            continue;
        }
        if !source.is_ready() {
            debug!("Video source not ready, skipping tick");
            continue;
        }

        let capture_source = source.clone();
        let encoded = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
            let frame = capture_source.capture()?;
            Ok(encode_frame(&frame, settings.max_width, settings.jpeg_quality)?)
        })
        .await;

        let jpeg = match encoded {
            Ok(Ok(jpeg)) => jpeg,
            Ok(Err(e)) => {
                debug!("Frame capture error: {:#}", e);
                continue;
            }
            Err(e) => {
                warn!("Frame capture task failed: {}", e);
                continue;
            }
        };

        match link.offer(ClientMessage::video(&jpeg, JPEG_MIME_TYPE)) {
            Offer::Sent => {
                let n = sent.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Sent video frame #{} ({} KB)", n, jpeg.len() / 1024);
            }
            Offer::Dropped => debug!("Transport busy, dropped video frame"),
            Offer::Detached => debug!("Session closed, video frame discarded"),
        }
    }
}

/// Primary monitor via `xcap`.
#[cfg(feature = "capture")]
#[derive(Debug, Default, Clone)]
pub struct ScreenSource;

#[cfg(feature = "capture")]
impl ScreenSource {
    pub fn new() -> anyhow::Result<Self> {
        let monitors = xcap::Monitor::all()?;
        anyhow::ensure!(!monitors.is_empty(), "No monitors found");
        Ok(Self)
    }
}

#[cfg(feature = "capture")]
impl VideoSource for ScreenSource {
    fn is_ready(&self) -> bool {
        true
    }

    fn capture(&self) -> anyhow::Result<RgbaImage> {
        let monitors = xcap::Monitor::all()?;
        let monitor = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .or_else(|| monitors.first())
            .ok_or_else(|| anyhow::anyhow!("No monitors found"))?;
        Ok(monitor.capture_image()?)
    }
}

#[cfg(not(feature = "capture"))]
#[derive(Debug, Default, Clone)]
pub struct ScreenSource;

#[cfg(not(feature = "capture"))]
impl ScreenSource {
    pub fn new() -> anyhow::Result<Self> {
        anyhow::bail!("screen capture feature not enabled")
    }
}

#[cfg(not(feature = "capture"))]
impl VideoSource for ScreenSource {
    fn is_ready(&self) -> bool {
        false
    }

    fn capture(&self) -> anyhow::Result<RgbaImage> {
        anyhow::bail!("screen capture feature not enabled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RealtimeInput;
    use crate::transport::TransportHandle;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    struct Pattern {
        ready: AtomicBool,
    }

    impl VideoSource for Pattern {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn capture(&self) -> anyhow::Result<RgbaImage> {
            Ok(RgbaImage::from_fn(1280, 720, |x, y| {
                image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
            }))
        }
    }

    fn settings() -> FrameSettings {
        FrameSettings {
            interval: Duration::from_millis(20),
            max_width: 640,
            jpeg_quality: 70,
        }
    }

    #[test]
    fn test_encode_frame_downscales_wide_frames() {
        let frame = RgbaImage::from_pixel(1280, 720, image::Rgba([10, 20, 30, 255]));
        let jpeg = encode_frame(&frame, 640, 75).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 360));

        let small = RgbaImage::from_pixel(320, 200, image::Rgba([0, 0, 0, 255]));
        let decoded = image::load_from_memory(&encode_frame(&small, 640, 75).unwrap()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (320, 200));
    }

    #[tokio::test]
    async fn test_ready_source_streams_jpeg_frames() {
        let (tx, mut rx) = mpsc::channel(16);
        let link = SessionLink::bound(1, TransportHandle::new(tx));
        let source = Arc::new(Pattern {
            ready: AtomicBool::new(true),
        });
        let streamer = VideoStreamer::start(source, link, settings());

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            ClientMessage::RealtimeInput(RealtimeInput { video: Some(blob), audio: None }) => {
                assert_eq!(blob.mime_type, JPEG_MIME_TYPE);
                assert!(!blob.data.is_empty());
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        streamer.stop();
        streamer.stop();
    }

    #[tokio::test]
    async fn test_not_ready_ticks_are_skipped() {
        let (tx, mut rx) = mpsc::channel(16);
        let link = SessionLink::bound(1, TransportHandle::new(tx));
        let source = Arc::new(Pattern {
            ready: AtomicBool::new(false),
        });
        let streamer = VideoStreamer::start(source.clone(), link, settings());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(streamer.frames_sent(), 0);

        source.ready.store(true, Ordering::SeqCst);
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(matches!(msg, Some(ClientMessage::RealtimeInput(_))));
        streamer.stop();
    }

    #[tokio::test]
    async fn test_detached_session_sends_nothing() {
        let source = Arc::new(Pattern {
            ready: AtomicBool::new(true),
        });
        let streamer = VideoStreamer::start(source, SessionLink::detached(), settings());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(streamer.frames_sent(), 0);
        streamer.stop();
    }
}
