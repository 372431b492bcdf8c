//! Plays a WAV file through the playback scheduler in network-sized chunks.
//!
//! Usage: playback_test <file.wav> [chunk_ms]
//!
//! Chunks arrive with jitter, the way model audio does, so any audible gap or
//! overlap points at the scheduler or the output device.

use anyhow::{bail, Context};
use pagelive::audio::{PlaybackPipeline, PulseSpeaker, SystemClock};
use pagelive::codec::{self, OUTPUT_SAMPLE_RATE};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn read_mono(path: &str) -> anyhow::Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::open(path).with_context(|| format!("Failed to open {}", path))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int if spec.bits_per_sample == 16 => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<Result<_, _>>()?,
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        _ => bail!("Unsupported WAV format: {:?}", spec),
    };

    let mono = interleaved
        .chunks(channels.max(1))
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let path = args.next().context("usage: playback_test <file.wav> [chunk_ms]")?;
    let chunk_ms: usize = args.next().map(|s| s.parse()).transpose()?.unwrap_or(100);

    let (samples, rate) = read_mono(&path)?;
    let samples = codec::resample(&samples, rate, OUTPUT_SAMPLE_RATE);
    info!(
        "Loaded {} ({:.2}s, resampled {}Hz -> {}Hz)",
        path,
        codec::duration_secs(samples.len(), OUTPUT_SAMPLE_RATE),
        rate,
        OUTPUT_SAMPLE_RATE
    );

    let pipeline = PlaybackPipeline::start(Arc::new(PulseSpeaker::default()), Arc::new(SystemClock::new()))?;
    let chunk_len = OUTPUT_SAMPLE_RATE as usize * chunk_ms / 1000;
    let started = Instant::now();

    for (i, chunk) in samples.chunks(chunk_len.max(1)).enumerate() {
        let pcm = codec::f32_to_pcm16(chunk);
        if let Some(source) = pipeline.enqueue(&pcm)? {
            info!(
                "Chunk {} scheduled at {:.3}s for {:.3}s (level {:.3})",
                i,
                source.start,
                source.duration,
                pipeline.meter().level()
            );
        }
        // Arrive a bit faster than real time, with some jitter.
        let jitter = (i % 3) as u64 * 10;
        std::thread::sleep(Duration::from_millis((chunk_ms as u64 * 3 / 4) + jitter));
    }

    while pipeline.scheduler().active_count() > 0 {
        std::thread::sleep(Duration::from_millis(50));
    }
    info!("Playback finished after {:.2}s", started.elapsed().as_secs_f64());
    pipeline.stop();
    Ok(())
}
