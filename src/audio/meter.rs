//! Output level meter
//!
//! Sits in the playback output path and keeps the latest RMS level plus a
//! handful of frequency band magnitudes (Goertzel filters). Reading it never
//! blocks the output thread for longer than a short lock.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Centre frequencies of the reported bands, in Hz.
pub const BAND_FREQUENCIES: [f32; 8] = [125.0, 250.0, 500.0, 1000.0, 2000.0, 3000.0, 4000.0, 6000.0];

#[derive(Debug)]
pub struct LevelMeter {
    sample_rate: u32,
    level: AtomicU32,
    bands: Mutex<[f32; BAND_FREQUENCIES.len()]>,
}

impl LevelMeter {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            level: AtomicU32::new(0f32.to_bits()),
            bands: Mutex::new([0.0; BAND_FREQUENCIES.len()]),
        }
    }

    /// Analyse one block of output samples.
    pub fn process(&self, block: &[f32]) {
        if block.is_empty() {
            return;
        }
        let sum_sq: f32 = block.iter().map(|s| s * s).sum();
        let rms = (sum_sq / block.len() as f32).sqrt();
        self.level.store(rms.to_bits(), Ordering::Relaxed);

        let mut magnitudes = [0.0; BAND_FREQUENCIES.len()];
        for (slot, freq) in magnitudes.iter_mut().zip(BAND_FREQUENCIES) {
            *slot = goertzel(block, freq, self.sample_rate);
        }
        if let Ok(mut bands) = self.bands.lock() {
            *bands = magnitudes;
        }
    }

    /// Latest RMS level, 0.0 to 1.0 for unclipped audio.
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    pub fn bands(&self) -> Vec<f32> {
        self.bands.lock().map(|b| b.to_vec()).unwrap_or_default()
    }

    /// Back to silence, e.g. after an interruption.
    pub fn reset(&self) {
        self.level.store(0f32.to_bits(), Ordering::Relaxed);
        if let Ok(mut bands) = self.bands.lock() {
            *bands = [0.0; BAND_FREQUENCIES.len()];
        }
    }
}

/// Normalised magnitude of `freq` in `block`; a full-scale sine reads ~1.0.
fn goertzel(block: &[f32], freq: f32, sample_rate: u32) -> f32 {
    let n = block.len() as f32;
    let k = (n * freq / sample_rate as f32).round();
    let coeff = 2.0 * (2.0 * PI * k / n).cos();

    let (mut s1, mut s2) = (0.0f32, 0.0f32);
    for &x in block {
        let s0 = x + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    let power = s1 * s1 + s2 * s2 - coeff * s1 * s2;
    power.max(0.0).sqrt() * 2.0 / n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, amplitude: f32, rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_rms_of_sine() {
        let meter = LevelMeter::new(24_000);
        meter.process(&sine(1000.0, 0.5, 24_000, 480));
        let expected = 0.5 / 2f32.sqrt();
        assert!((meter.level() - expected).abs() < 0.01, "level {}", meter.level());
    }

    #[test]
    fn test_dominant_band_matches_tone() {
        let meter = LevelMeter::new(24_000);
        meter.process(&sine(1000.0, 0.8, 24_000, 480));
        let bands = meter.bands();
        let loudest = bands
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(BAND_FREQUENCIES[loudest], 1000.0);
        assert!((bands[loudest] - 0.8).abs() < 0.05, "magnitude {}", bands[loudest]);
    }

    #[test]
    fn test_reset_and_silence() {
        let meter = LevelMeter::new(24_000);
        meter.process(&sine(500.0, 1.0, 24_000, 480));
        assert!(meter.level() > 0.5);
        meter.reset();
        assert_eq!(meter.level(), 0.0);
        assert!(meter.bands().iter().all(|b| *b == 0.0));

        meter.process(&[0.0; 480]);
        assert_eq!(meter.level(), 0.0);
        meter.process(&[]);
        assert_eq!(meter.level(), 0.0);
    }
}
