//! Audio codec utilities
//!
//! Pure conversions between floating point samples and the 16-bit little-endian
//! PCM exchanged with the Live API, plus the base64 framing used on the wire.

use crate::error::{LiveError, Result};
use base64::engine::general_purpose;
use base64::Engine;

/// Sample rate of microphone audio sent to the service.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of synthesized audio received from the service.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// MIME type announced for outbound audio.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Convert `[-1.0, 1.0]` float samples to PCM16 LE bytes. Out of range input is clamped.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
        let v = if clamped < 0.0 {
            (clamped * 32768.0) as i16
        } else {
            (clamped * 32767.0) as i16
        };
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Convert PCM16 LE bytes to float samples. A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            v as f32 / 32768.0
        })
        .collect()
}

/// Base64 encode a wire payload.
pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Decode an inbound base64 audio payload into PCM16 LE bytes.
pub fn decode_audio_payload(data: &str) -> Result<Vec<u8>> {
    let bytes = general_purpose::STANDARD
        .decode(data)
        .map_err(|e| LiveError::Decode(e.to_string()))?;
    if bytes.len() % 2 != 0 {
        return Err(LiveError::Decode(format!(
            "odd PCM16 payload length {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Duration in seconds of `samples` mono samples at `rate`.
pub fn duration_secs(samples: usize, rate: u32) -> f64 {
    samples as f64 / rate as f64
}

/// Nearest-sample resampling, used when a device refuses the requested rate.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio) as usize;
    (0..output_len)
        .map(|i| {
            let src = (i as f64 * ratio) as usize;
            samples.get(src).copied().unwrap_or(0.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_to_pcm16_extremes() {
        let bytes = f32_to_pcm16(&[0.0, 1.0, -1.0, 2.0, -3.0]);
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples, vec![0, i16::MAX, i16::MIN, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_pcm16_to_f32_ignores_trailing_byte() {
        let mut bytes = f32_to_pcm16(&[0.5, -0.5]);
        bytes.push(7);
        let samples = pcm16_to_f32(&bytes);
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.5).abs() < 1e-4);
        assert!((samples[1] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_decode_audio_payload() {
        let data = encode_base64(&f32_to_pcm16(&[0.0, 1.0]));
        let bytes = decode_audio_payload(&data).unwrap();
        assert_eq!(bytes, vec![0, 0, 0xFF, 0x7F]);
        let samples = pcm16_to_f32(&bytes);
        assert!(samples[1] > 0.99);

        assert!(decode_audio_payload("not base64!!").is_err());
        assert!(decode_audio_payload(&encode_base64(&[1, 2, 3])).is_err());
    }

    #[test]
    fn test_duration_and_resample() {
        assert!((duration_secs(4800, OUTPUT_SAMPLE_RATE) - 0.2).abs() < 1e-9);

        let input: Vec<f32> = (0..480).map(|i| i as f32).collect();
        let out = resample(&input, 48_000, 16_000);
        assert_eq!(out.len(), 160);
        assert_eq!(out[1], 3.0);
    }
}
