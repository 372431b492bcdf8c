//! PulseAudio devices
//!
//! Microphone input and speaker output through the PulseAudio simple API,
//! both as mono `F32le`. Without the `pulse` feature the same types exist but
//! fail to open, so the session reports a media device error.

use super::capture::{MicrophoneSource, MicrophoneStream};
use super::playback::{AudioOutput, AudioSink};

#[cfg(feature = "pulse")]
mod imp {
    use super::*;
    use anyhow::Context;
    use libpulse_binding::sample::{Format, Spec};
    use libpulse_binding::stream::Direction;
    use libpulse_simple_binding::Simple;
    use tracing::info;

    const APP_NAME: &str = "pagelive";

    fn spec(rate: u32) -> Spec {
        Spec {
            format: Format::F32le,
            channels: 1,
            rate,
        }
    }

    /// Default PulseAudio source.
    #[derive(Debug, Default, Clone)]
    pub struct PulseMicrophone {
        pub device: Option<String>,
    }

    struct PulseInput {
        simple: Simple,
        bytes: Vec<u8>,
    }

    impl MicrophoneSource for PulseMicrophone {
        fn open(&self, sample_rate: u32) -> anyhow::Result<Box<dyn MicrophoneStream>> {
            let simple = Simple::new(
                None,
                APP_NAME,
                Direction::Record,
                self.device.as_deref(),
                "microphone",
                &spec(sample_rate),
                None,
                None,
            )
            .context("Failed to create PulseAudio microphone connection")?;
            info!("Microphone connected ({})", self.device.as_deref().unwrap_or("default source"));
            Ok(Box::new(PulseInput {
                simple,
                bytes: Vec::new(),
            }))
        }
    }

    impl MicrophoneStream for PulseInput {
        fn read_block(&mut self, block: &mut [f32]) -> anyhow::Result<()> {
            self.bytes.resize(block.len() * 4, 0);
            self.simple.read(&mut self.bytes).context("Failed to read audio")?;
            for (sample, chunk) in block.iter_mut().zip(self.bytes.chunks_exact(4)) {
                *sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            Ok(())
        }
    }

    /// Default PulseAudio sink.
    #[derive(Debug, Default, Clone)]
    pub struct PulseSpeaker {
        pub device: Option<String>,
    }

    struct PulseOutput {
        simple: Simple,
        bytes: Vec<u8>,
    }

    impl AudioOutput for PulseSpeaker {
        fn open(&self, sample_rate: u32) -> anyhow::Result<Box<dyn AudioSink>> {
            let simple = Simple::new(
                None,
                APP_NAME,
                Direction::Playback,
                self.device.as_deref(),
                "assistant voice",
                &spec(sample_rate),
                None,
                None,
            )
            .context("Failed to create PulseAudio playback connection")?;
            info!("Speaker connected ({})", self.device.as_deref().unwrap_or("default sink"));
            Ok(Box::new(PulseOutput {
                simple,
                bytes: Vec::new(),
            }))
        }
    }

    impl AudioSink for PulseOutput {
        fn write(&mut self, samples: &[f32]) -> anyhow::Result<()> {
            self.bytes.clear();
            self.bytes.extend(samples.iter().flat_map(|s| s.to_le_bytes()));
            self.simple.write(&self.bytes).context("Failed to write audio")?;
            Ok(())
        }

        fn discard(&mut self) -> anyhow::Result<()> {
            self.simple.flush().context("Failed to flush playback buffer")?;
            Ok(())
        }
    }

    impl Drop for PulseOutput {
        fn drop(&mut self) {
            let _ = self.simple.drain();
        }
    }
}

#[cfg(not(feature = "pulse"))]
mod imp {
    use super::*;
    use anyhow::anyhow;

    #[derive(Debug, Default, Clone)]
    pub struct PulseMicrophone {
        pub device: Option<String>,
    }

    impl MicrophoneSource for PulseMicrophone {
        fn open(&self, _sample_rate: u32) -> anyhow::Result<Box<dyn MicrophoneStream>> {
            Err(anyhow!("Microphone capture is not available in this build (missing 'pulse' feature)"))
        }
    }

    #[derive(Debug, Default, Clone)]
    pub struct PulseSpeaker {
        pub device: Option<String>,
    }

    impl AudioOutput for PulseSpeaker {
        fn open(&self, _sample_rate: u32) -> anyhow::Result<Box<dyn AudioSink>> {
            Err(anyhow!("Audio playback is not available in this build (missing 'pulse' feature)"))
        }
    }
}

pub use imp::{PulseMicrophone, PulseSpeaker};

#[cfg(all(test, not(feature = "pulse")))]
mod tests {
    use super::*;

    #[test]
    fn test_devices_unavailable_without_pulse() {
        let err = PulseMicrophone::default().open(16_000).err().unwrap();
        assert!(err.to_string().contains("pulse"));
        assert!(PulseSpeaker::default().open(24_000).is_err());
    }
}
