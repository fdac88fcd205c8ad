//! Float to 16-bit PCM conversion.

/// Scale applied to normalized float samples.
pub const PCM16_SCALE: f32 = 32767.0;

/// Converts normalized float samples to signed 16-bit PCM.
///
/// Samples are scaled by 32767, truncated toward zero and clamped to the
/// `i16` range. Out-of-range input saturates instead of wrapping, so `-1.0`
/// maps to `-32767` and anything below `-1.0` can reach `-32768`.
///
/// Only `min(input.len(), output.len())` samples are written.
pub fn cast_buffer(input: &[f32], output: &mut [i16]) {
    for (out, &sample) in output.iter_mut().zip(input) {
        *out = cast_sample(sample);
    }
}

/// Converts one normalized float sample to 16-bit PCM.
#[must_use]
pub fn cast_sample(sample: f32) -> i16 {
    let scaled = (PCM16_SCALE * sample) as i32;
    scaled.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}
