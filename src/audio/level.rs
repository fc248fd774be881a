//! Amplitude measurement and gain normalisation for PCM16 audio.
//!
//! The gain is `min(target / peak, gain_cap)`.  A buffer that already peaks
//! above the target is attenuated (gain < 1.0); a near-silent buffer is lifted
//! at most by `gain_cap`.

use super::container::{pcm16_to_samples, samples_to_pcm16};

const FULL_SCALE: f32 = i16::MAX as f32;

/// Largest absolute sample value (`i16::MIN` maps to 32 768).
pub fn peak_amplitude(samples: &[i16]) -> u16 {
    samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0)
}

/// Root-mean-square level of `samples`, scaled to `0.0..=1.0`.
pub fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s);
            v * v
        })
        .sum::<f64>()
        / samples.len() as f64;
    ((mean_sq.sqrt() / f64::from(FULL_SCALE)) as f32).clamp(0.0, 1.0)
}

/// Gain that brings `peak` to `target_amplitude` (fraction of full scale),
/// never exceeding `gain_cap`.  Silence yields `1.0`.
pub fn compute_gain(peak: u16, target_amplitude: f32, gain_cap: f32) -> f32 {
    if peak == 0 {
        return 1.0;
    }
    let target = target_amplitude.clamp(0.0, 1.0) * FULL_SCALE;
    (target / f32::from(peak)).min(gain_cap.max(0.0))
}

/// Multiply every sample by `gain`, clamping to the 16-bit range.
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    for s in samples.iter_mut() {
        let scaled = (f32::from(*s) * gain).round();
        *s = scaled.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
    }
}

/// Normalise a little-endian PCM16 buffer.  Returns the processed bytes and
/// the gain that was applied.
pub fn normalize_pcm(pcm: &[u8], target_amplitude: f32, gain_cap: f32) -> (Vec<u8>, f32) {
    let mut samples = pcm16_to_samples(pcm);
    let gain = compute_gain(peak_amplitude(&samples), target_amplitude, gain_cap);
    apply_gain(&mut samples, gain);
    (samples_to_pcm16(&samples), gain)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
