//! Sample-rate conversion and channel mixing for PCM16 audio.
//!
//! The backend speaks **24 kHz mono PCM16** in both directions while the
//! device runs at whatever its default stream config reports.  This module
//! provides the conversion steps used on both sides:
//!
//! 1. [`downmix`]: interleaved multi-channel → mono (capture side).
//! 2. [`resample`]: any rate → any rate, linear interpolation.
//! 3. [`upmix`]: mono → interleaved multi-channel (output side).

// ---------------------------------------------------------------------------
// Channel mixing
// ---------------------------------------------------------------------------

/// Mix interleaved audio down to mono by averaging each frame.
///
/// * `channels == 1` returns the input unchanged.
/// * `channels == 0` returns an empty vector.
/// * A trailing partial frame is dropped.
///
/// ```rust
/// use voice_session::audio::resample::downmix;
///
/// let stereo = vec![100_i16, -100, 400, 200]; // L R L R
/// assert_eq!(downmix(&stereo, 2), vec![0, 300]);
/// ```
pub fn downmix(samples: &[i16], channels: u16) -> Vec<i16> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| {
                    let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
                    (sum / n as i32) as i16
                })
                .collect()
        }
    }
}

/// Duplicate each mono sample across `channels` interleaved slots.
pub fn upmix(samples: &[i16], channels: u16) -> Vec<i16> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => samples
            .iter()
            .flat_map(|&s| std::iter::repeat(s).take(n as usize))
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// resample
// ---------------------------------------------------------------------------

/// Resample mono `samples` from `source_rate` to `target_rate` Hz using
/// linear interpolation.
///
/// Equal rates and empty input are returned as-is.  The output length is
/// `ceil(samples.len() * target_rate / source_rate)`.
///
/// ```rust
/// use voice_session::audio::resample::resample;
///
/// let hi = vec![500_i16; 480]; // 10 ms @ 48 kHz
/// assert_eq!(resample(&hi, 48_000, 24_000).len(), 240);
/// ```
pub fn resample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if source_rate == target_rate || source_rate == 0 || target_rate == 0 {
        return samples.to_vec();
    }

    if samples.is_empty() {
        return Vec::new();
    }

    let ratio = f64::from(target_rate) / f64::from(source_rate);
    let output_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 / ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else if idx < samples.len() {
            f64::from(samples[idx])
        } else {
            0.0
        };

        output.push(sample.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16);
    }

    output
}

/// Convert PCM16 samples to `f32` in `[-1.0, 1.0)`.
pub fn to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| f32::from(s) / 32_768.0).collect()
}

/// Convert `f32` samples in `[-1.0, 1.0]` to PCM16, clamping out-of-range input.
pub fn to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32_767.0).round() as i16)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
