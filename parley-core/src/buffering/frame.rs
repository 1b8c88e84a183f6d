//! Outbound capture frames.
//!
//! Frame boundaries follow the capture clock: a frame is complete when
//! `frame_samples` samples have arrived, however long that took in wall time.

use crate::codec;

/// A fixed-length block of mono PCM16 LE samples ready for transmission.
///
/// Immutable once produced; handed to the transport exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Capture-order sequence number within one session (0-based).
    pub seq: u64,
    /// PCM16 little-endian bytes.
    pub pcm: Vec<u8>,
    /// Sample rate in Hz (nominally 16000).
    pub sample_rate: u32,
}

impl AudioFrame {
    /// Encode a block of f32 samples into a frame.
    pub fn encode(seq: u64, samples: &[f32], sample_rate: u32) -> Self {
        Self {
            seq,
            pcm: codec::encode(samples),
            sample_rate,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.pcm.len() / codec::BYTES_PER_SAMPLE
    }

    pub fn duration_secs(&self) -> f64 {
        self.sample_count() as f64 / self.sample_rate as f64
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pcm
    }
}

/// Slices an arbitrary stream of samples into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        }
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Samples held back waiting for the next frame boundary.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed samples; `on_frame` is called once per completed frame, in order.
    ///
    /// Returns the number of frames completed by this call.
    pub fn push<F>(&mut self, mut samples: &[f32], mut on_frame: F) -> usize
    where
        F: FnMut(&[f32]),
    {
        let mut completed = 0;
        while !samples.is_empty() {
            // Fast path: no partial frame pending, emit straight from the input.
            if self.pending.is_empty() && samples.len() >= self.frame_samples {
                let (frame, rest) = samples.split_at(self.frame_samples);
                on_frame(frame);
                completed += 1;
                samples = rest;
                continue;
            }

            let take = (self.frame_samples - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.frame_samples {
                on_frame(&self.pending);
                self.pending.clear();
                completed += 1;
            }
        }
        completed
    }
}
