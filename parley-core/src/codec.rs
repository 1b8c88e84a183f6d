//! PCM codec: f32 samples ↔ 16-bit little-endian PCM ↔ text-safe payloads.
//!
//! ## Wire layout
//!
//! Mono, signed 16-bit, little-endian, no header. The outbound stream runs at
//! 16 kHz and the inbound stream at 24 kHz; the codec itself is rate-agnostic.
//!
//! ## Scaling
//!
//! Both directions scale by `i16::MAX` so that `decode(encode(x))` stays within
//! one quantisation step (`1 / 32767`) of `x` for every `x` in `[-1.0, 1.0]`.
//! `i16::MIN` decodes to exactly `-1.0`.

use base64::Engine as _;

use crate::error::{ParleyError, Result};

/// Scale factor between normalised f32 and signed 16-bit samples.
const PCM16_SCALE: f32 = i16::MAX as f32;

/// Bytes per encoded sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// One 16-bit quantisation step in normalised units.
pub const QUANTIZATION_STEP: f32 = 1.0 / PCM16_SCALE;

/// Encode f32 samples as PCM16 LE bytes.
///
/// Non-finite samples (NaN, ±Inf) are written as silence; everything else is
/// clamped to `[-1.0, 1.0]`, scaled and truncated toward zero.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    encode_into(samples, &mut out);
    out
}

/// Append the PCM16 LE encoding of `samples` to `out`.
pub fn encode_into(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        out.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
}

/// Decode PCM16 LE bytes into f32 samples in `[-1.0, 1.0]`.
///
/// # Errors
/// `ParleyError::MalformedPayload` when the byte length is odd.
pub fn decode(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % BYTES_PER_SAMPLE != 0 {
        return Err(ParleyError::MalformedPayload(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16_to_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

/// Encode samples as a base64 string of PCM16 LE bytes.
pub fn encode_base64(samples: &[f32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(encode(samples))
}

/// Decode a base64 payload into raw PCM16 LE bytes (not yet converted to f32).
///
/// # Errors
/// `ParleyError::MalformedPayload` if the text is not valid base64.
pub fn decode_base64_bytes(payload: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| ParleyError::MalformedPayload(format!("invalid base64: {e}")))
}

/// Decode a base64 PCM16 payload straight to f32 samples.
pub fn decode_base64(payload: &str) -> Result<Vec<f32>> {
    decode(&decode_base64_bytes(payload)?)
}

#[inline]
fn sample_to_i16(sample: f32) -> i16 {
    if !sample.is_finite() {
        return 0;
    }
    // `as` truncates toward zero; the clamp keeps the product inside i16.
    (sample.clamp(-1.0, 1.0) * PCM16_SCALE) as i16
}

#[inline]
fn i16_to_sample(value: i16) -> f32 {
    (value as f32 / PCM16_SCALE).max(-1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn encodes_little_endian_and_clamps() {
        let bytes = encode(&[0.0, 1.0, -1.0, 2.5, -7.0]);
        let words: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(words, vec![0, 32767, -32767, 32767, -32767]);
        // 32767 = 0xFF 0x7F in little-endian order
        assert_eq!(&bytes[2..4], &[0xFF, 0x7F]);
    }

    #[test]
    fn truncates_toward_zero() {
        // 0.5 * 32767 = 16383.5 → 16383; -0.5 → -16383
        let bytes = encode(&[0.5, -0.5]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 16383);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -16383);
    }

    #[test]
    fn non_finite_samples_become_silence() {
        let bytes = encode(&[f32::NAN, f32::INFINITY, f32::NEG_INFINITY]);
        assert!(bytes.iter().all(|&b| b == 0), "got {bytes:?}");
    }

    #[test]
    fn decode_rejects_odd_length() {
        let err = decode(&[0x01, 0x02, 0x03]).unwrap_err();
        assert!(matches!(err, ParleyError::MalformedPayload(_)));
    }

    #[test]
    fn decode_empty_is_empty() {
        assert!(decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn decode_extremes_stay_in_range() {
        let min = i16::MIN.to_le_bytes();
        let max = i16::MAX.to_le_bytes();
        let samples = decode(&[min[0], min[1], max[0], max[1]]).unwrap();
        assert_eq!(samples, vec![-1.0, 1.0]);
    }

    #[test]
    fn round_trip_within_one_step() {
        let input: Vec<f32> = (0..2_000)
            .map(|i| ((i as f32 * 0.37).sin() * 1.1).clamp(-1.0, 1.0))
            .chain([1.0, -1.0, 0.999_99, -0.999_99, 1e-6, -1e-6])
            .collect();
        let output = decode(&encode(&input)).unwrap();
        assert_eq!(output.len(), input.len());
        for (x, y) in input.iter().zip(&output) {
            assert!(
                (x - y).abs() <= QUANTIZATION_STEP,
                "x={x} y={y} diff={}",
                (x - y).abs()
            );
        }
    }

    #[test]
    fn base64_payload_round_trip() {
        let samples = [0.25f32, -0.25, 0.0];
        let payload = encode_base64(&samples);
        let decoded = decode_base64(&payload).unwrap();
        for (x, y) in samples.iter().zip(&decoded) {
            assert_abs_diff_eq!(*x, *y, epsilon = QUANTIZATION_STEP);
        }
    }

    #[test]
    fn base64_rejects_garbage() {
        let err = decode_base64("not base64 !!").unwrap_err();
        assert!(matches!(err, ParleyError::MalformedPayload(_)));
    }
}
