//! Inbound audio chunk owned by the playback scheduler.

/// A variable-length block of mono samples at the output sample rate,
/// pinned to a start time on the output clock.
///
/// Created by the scheduler when a payload is admitted and handed to the
/// playback sink. Released when it finishes playing or is flushed.
#[derive(Debug, Clone)]
pub struct PlaybackChunk {
    /// Admission-order identifier, unique within one scheduler.
    pub id: u64,
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (nominally 24000).
    pub sample_rate: u32,
    /// Output-clock time (seconds) at which the first sample must sound.
    pub scheduled_start: f64,
}

impl PlaybackChunk {
    pub fn new(id: u64, samples: Vec<f32>, sample_rate: u32, scheduled_start: f64) -> Self {
        Self {
            id,
            samples,
            sample_rate,
            scheduled_start,
        }
    }

    /// Returns the duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Output-clock time at which the last sample has finished playing.
    pub fn end_secs(&self) -> f64 {
        self.scheduled_start + self.duration_secs()
    }
}
