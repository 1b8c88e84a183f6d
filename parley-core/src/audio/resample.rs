//! Sample-rate conversion with rubato `FastFixedIn`.
//!
//! Two shapes are needed:
//!
//! - `RateConverter`: a streaming converter for the capture path. The
//!   microphone runs at whatever the device offers (commonly 44.1/48 kHz); the
//!   wire wants 16 kHz. Input arrives in arbitrary slices, so partial blocks
//!   are carried between calls.
//! - `resample_block`: a one-shot converter for a whole inbound chunk
//!   (24 kHz wire rate → output device rate). The result is padded or trimmed
//!   to exactly `round(len * to / from)` samples so chunk spans on the device
//!   clock line up back to back.
//!
//! When the two rates match both are plain copies and no rubato session is
//! created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{ParleyError, Result};

/// Input block size for one-shot chunk conversion.
const BLOCK_CHUNK: usize = 1024;

/// Upper bound on drain passes when flushing the resampler delay line.
const MAX_FLUSH_PASSES: usize = 4;

fn new_resampler(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<FastFixedIn<f32>> {
    let ratio = to_rate as f64 / from_rate as f64;
    FastFixedIn::<f32>::new(
        ratio,
        1.0, // fixed ratio, no dynamic adjustment
        PolynomialDegree::Cubic,
        chunk_size,
        1, // mono
    )
    .map_err(|e| ParleyError::AudioDevice(format!("resampler init: {e}")))
}

/// Converts a continuous f32 mono stream from one fixed rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Holds input that does not yet fill a whole rubato block.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `ParleyError::AudioDevice` if rubato rejects the configuration.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let resampler = new_resampler(source_rate, target_rate, chunk_size)?;
        let max_out = resampler.output_frames_max();

        tracing::info!(source_rate, target_rate, chunk_size, max_out, "capture resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf: vec![vec![0f32; max_out]; 1],
        })
    }

    /// Process incoming samples, returning converted output (may be empty
    /// while a block is still filling).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let block = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[block], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }
            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Returns `true` when no conversion takes place.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Number of output samples a block of `len` input samples maps to.
pub fn converted_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    if from_rate == to_rate {
        return len;
    }
    ((len as f64) * to_rate as f64 / from_rate as f64).round() as usize
}

/// Convert one self-contained block of mono samples.
///
/// The resampler's delay line is drained and trimmed so the output is aligned
/// with the input and exactly `converted_len` samples long.
///
/// # Errors
/// `ParleyError::AudioDevice` if rubato fails.
pub fn resample_block(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    let expected = converted_len(samples.len(), from_rate, to_rate);
    resample_to_len(samples, from_rate, to_rate, expected)
}

/// Like [`resample_block`], but pads or trims the result to exactly `expected`
/// samples. Used when the output span is fixed by the device clock rather
/// than by the block length.
///
/// # Errors
/// `ParleyError::AudioDevice` if rubato fails.
pub fn resample_to_len(
    samples: &[f32],
    from_rate: u32,
    to_rate: u32,
    expected: usize,
) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        let mut out = samples.to_vec();
        out.resize(expected, 0.0);
        return Ok(out);
    }

    let mut resampler = new_resampler(from_rate, to_rate, BLOCK_CHUNK)?;
    let delay = resampler.output_delay();
    let mut out_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];
    let mut out = Vec::with_capacity(expected + delay + BLOCK_CHUNK);

    let map_err = |e: rubato::ResampleError| ParleyError::AudioDevice(format!("resample: {e}"));

    let mut blocks = samples.chunks_exact(BLOCK_CHUNK);
    for block in blocks.by_ref() {
        let (_, produced) = resampler
            .process_into_buffer(&[block], &mut out_buf, None)
            .map_err(map_err)?;
        out.extend_from_slice(&out_buf[0][..produced]);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let (_, produced) = resampler
            .process_partial_into_buffer(Some(&[tail]), &mut out_buf, None)
            .map_err(map_err)?;
        out.extend_from_slice(&out_buf[0][..produced]);
    }

    let mut passes = 0;
    while out.len() < expected + delay && passes < MAX_FLUSH_PASSES {
        let (_, produced) = resampler
            .process_partial_into_buffer(None::<&[&[f32]]>, &mut out_buf, None)
            .map_err(map_err)?;
        if produced == 0 {
            break;
        }
        out.extend_from_slice(&out_buf[0][..produced]);
        passes += 1;
    }

    let mut aligned: Vec<f32> = out.into_iter().skip(delay).collect();
    aligned.resize(expected, 0.0);
    Ok(aligned)
}
