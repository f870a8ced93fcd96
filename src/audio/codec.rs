//! PCM16 conversion and the adaptive noise floor used for turn detection.
//!
//! Everything here runs per capture callback, so it stays allocation-light
//! and proportional to the frame size.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::AudioError;

pub const SAMPLE_RATE: u32 = 24_000;

pub const MIN_VAD_THRESHOLD: f32 = 0.3;
pub const MAX_VAD_THRESHOLD: f32 = 0.8;
const BASE_VAD_THRESHOLD: f32 = 0.5;
const NOISE_GAIN: f32 = 2.0;
const NOISE_DECAY: f32 = 0.9;

/// Float samples to 16-bit signed little-endian PCM.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // NaN clamps to NaN and then casts to 0.
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// 16-bit signed little-endian PCM back to floats. A dangling odd byte is dropped.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32)
        .map(|sample| sample.max(-1.0))
        .collect()
}

pub fn encode_base64(samples: &[f32]) -> String {
    STANDARD.encode(encode_pcm16(samples))
}

pub fn decode_base64(data: &str) -> Result<Vec<f32>, AudioError> {
    let bytes = STANDARD.decode(data)?;
    Ok(decode_pcm16(&bytes))
}

pub fn frame_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Speech threshold for a given ambient noise estimate, always within
/// `[MIN_VAD_THRESHOLD, MAX_VAD_THRESHOLD]`.
pub fn vad_threshold(noise_estimate: f32) -> f32 {
    let raw = BASE_VAD_THRESHOLD + NOISE_GAIN * noise_estimate;
    if raw.is_nan() {
        return MAX_VAD_THRESHOLD;
    }
    raw.clamp(MIN_VAD_THRESHOLD, MAX_VAD_THRESHOLD)
}

/// Exponential moving average of frame energy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoiseFloor {
    estimate: f32,
}

impl NoiseFloor {
    pub fn observe(&mut self, samples: &[f32]) -> f32 {
        let rms = frame_rms(samples);
        self.estimate = NOISE_DECAY * self.estimate + (1.0 - NOISE_DECAY) * rms;
        self.estimate
    }

    pub fn estimate(&self) -> f32 {
        self.estimate
    }

    pub fn threshold(&self) -> f32 {
        vad_threshold(self.estimate)
    }
}
