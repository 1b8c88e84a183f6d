//! Playback scheduling for inbound model speech.
//!
//! ## Admission
//!
//! ```text
//! payload ─► codec::decode ─► start = cursor if ahead of clock.now(), else now + lead
//!                              │
//!                      sink.schedule(chunk @ start)
//!                              │
//!                cursor = start + duration, chunk → active set
//! ```
//!
//! Chunks are admitted in arrival order and each one starts exactly where the
//! previous one ends, unless the output clock has already passed that point,
//! in which case it starts now, plus the sink's scheduling lead. There is no
//! jitter buffer beyond the cursor.
//!
//! ## Interrupt
//!
//! `flush` stops every active chunk on the sink, empties the active set, unsets
//! the cursor and reports silence immediately.
//!
//! ## Producing-sound observable
//!
//! `PlaybackActivityEvent` is broadcast only when the active set goes from
//! empty to non-empty or back, so subscribers see each transition exactly once.

use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    buffering::chunk::PlaybackChunk,
    codec,
    error::{ParleyError, Result},
    ipc::events::PlaybackActivityEvent,
};

/// Monotonic output-clock time source, in seconds.
pub trait OutputClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Audio output that plays chunks at absolute times on its own clock.
pub trait PlaybackSink: OutputClock {
    /// Queue `chunk` to start at `chunk.scheduled_start`.
    ///
    /// # Errors
    /// `ParleyError::AudioStream` if the output is gone.
    fn schedule(&self, chunk: PlaybackChunk) -> Result<()>;

    /// Silence chunk `id` immediately, wherever it is in its playback.
    fn stop(&self, id: u64);

    /// Seconds ahead of `now()` at which a chunk admitted into silence is
    /// placed, so it can reach the output before its first frame is due.
    fn scheduling_lead(&self) -> f64 {
        0.0
    }

    /// Release the output hardware. Idempotent.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens a `PlaybackSink` for one session.
pub trait OutputDevice: Send + Sync + 'static {
    /// # Errors
    /// `ParleyError::NoDefaultOutputDevice` / `AudioStream` on device failure.
    fn open(&self, sample_rate: u32) -> Result<Arc<dyn PlaybackSink>>;
}

/// Scheduling record for an admitted chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: u64,
    /// Output-clock start time (seconds).
    pub start: f64,
    /// Duration (seconds).
    pub duration: f64,
}

impl ScheduledChunk {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

#[derive(Default)]
pub struct PlaybackDiagnostics {
    pub chunks_admitted: AtomicUsize,
    pub chunks_completed: AtomicUsize,
    pub chunks_flushed: AtomicUsize,
    pub chunks_malformed: AtomicUsize,
    pub chunks_rejected_by_sink: AtomicUsize,
    pub flushes: AtomicUsize,
    /// Remote interruptions observed (each one triggers a flush).
    pub interrupts: AtomicUsize,
}

impl PlaybackDiagnostics {
    pub fn reset(&self) {
        self.chunks_admitted.store(0, Ordering::Relaxed);
        self.chunks_completed.store(0, Ordering::Relaxed);
        self.chunks_flushed.store(0, Ordering::Relaxed);
        self.chunks_malformed.store(0, Ordering::Relaxed);
        self.chunks_rejected_by_sink.store(0, Ordering::Relaxed);
        self.flushes.store(0, Ordering::Relaxed);
        self.interrupts.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PlaybackDiagnosticsSnapshot {
        PlaybackDiagnosticsSnapshot {
            chunks_admitted: self.chunks_admitted.load(Ordering::Relaxed),
            chunks_completed: self.chunks_completed.load(Ordering::Relaxed),
            chunks_flushed: self.chunks_flushed.load(Ordering::Relaxed),
            chunks_malformed: self.chunks_malformed.load(Ordering::Relaxed),
            chunks_rejected_by_sink: self.chunks_rejected_by_sink.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackDiagnosticsSnapshot {
    pub chunks_admitted: usize,
    pub chunks_completed: usize,
    pub chunks_flushed: usize,
    pub chunks_malformed: usize,
    pub chunks_rejected_by_sink: usize,
    pub flushes: usize,
    pub interrupts: usize,
}

/// Sole owner of the playback cursor and the active chunk set.
///
/// Not internally synchronised: the session controller keeps it behind one
/// lock and mutates it from a single task.
pub struct PlaybackScheduler {
    sink: Arc<dyn PlaybackSink>,
    sample_rate: u32,
    /// Earliest start for the next chunk; `None` means "now".
    cursor: Option<f64>,
    active: BTreeMap<u64, ScheduledChunk>,
    next_id: u64,
    producing: bool,
    activity_tx: broadcast::Sender<PlaybackActivityEvent>,
    activity_seq: u64,
    diagnostics: Arc<PlaybackDiagnostics>,
}

impl PlaybackScheduler {
    pub fn new(
        sink: Arc<dyn PlaybackSink>,
        sample_rate: u32,
        activity_tx: broadcast::Sender<PlaybackActivityEvent>,
        diagnostics: Arc<PlaybackDiagnostics>,
    ) -> Self {
        Self {
            sink,
            sample_rate,
            cursor: None,
            active: BTreeMap::new(),
            next_id: 0,
            producing: false,
            activity_tx,
            activity_seq: 0,
            diagnostics,
        }
    }

    /// Decode and schedule one inbound PCM16 payload.
    ///
    /// # Errors
    /// `ParleyError::MalformedPayload` if the payload does not decode or holds
    /// no samples (the chunk is dropped, nothing else changes);
    /// a sink error if the output refused the chunk.
    pub fn admit(&mut self, payload: &[u8]) -> Result<ScheduledChunk> {
        let samples = codec::decode(payload).inspect_err(|_| {
            self.diagnostics
                .chunks_malformed
                .fetch_add(1, Ordering::Relaxed);
        })?;
        self.admit_samples(samples)
    }

    /// Schedule already-decoded samples at the output sample rate.
    pub fn admit_samples(&mut self, samples: Vec<f32>) -> Result<ScheduledChunk> {
        if samples.is_empty() {
            self.diagnostics
                .chunks_malformed
                .fetch_add(1, Ordering::Relaxed);
            return Err(ParleyError::MalformedPayload(
                "chunk carries no samples".into(),
            ));
        }

        // A cursor still ahead of the clock keeps the chunk contiguous, even
        // inside the lead window. Otherwise start fresh, ahead by the lead.
        let now = self.sink.now();
        let start = match self.cursor {
            Some(cursor) if cursor > now => cursor,
            _ => now + self.sink.scheduling_lead().max(0.0),
        };

        let id = self.next_id;
        let chunk = PlaybackChunk::new(id, samples, self.sample_rate, start);
        let scheduled = ScheduledChunk {
            id,
            start,
            duration: chunk.duration_secs(),
        };

        if let Err(e) = self.sink.schedule(chunk) {
            self.diagnostics
                .chunks_rejected_by_sink
                .fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        self.next_id += 1;
        self.cursor = Some(scheduled.end());
        self.active.insert(id, scheduled);
        self.diagnostics
            .chunks_admitted
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            chunk_id = id,
            start = format_args!("{:.4}", start),
            duration = format_args!("{:.4}", scheduled.duration),
            lead = format_args!("{:.4}", start - now),
            active = self.active.len(),
            "chunk scheduled"
        );
        self.set_producing(true);
        Ok(scheduled)
    }

    /// Natural end of one chunk's playback.
    ///
    /// Returns `false` if the chunk was not active (already completed or flushed).
    pub fn complete(&mut self, id: u64) -> bool {
        if self.active.remove(&id).is_none() {
            return false;
        }
        self.diagnostics
            .chunks_completed
            .fetch_add(1, Ordering::Relaxed);
        if self.active.is_empty() {
            self.set_producing(false);
        }
        true
    }

    /// Complete every active chunk whose end has passed on the output clock.
    ///
    /// Returns the number of chunks completed.
    pub fn reap(&mut self) -> usize {
        if self.active.is_empty() {
            return 0;
        }
        let now = self.sink.now();
        let finished: Vec<u64> = self
            .active
            .values()
            .filter(|c| c.end() <= now)
            .map(|c| c.id)
            .collect();
        for id in &finished {
            self.complete(*id);
        }
        finished.len()
    }

    /// Stop everything now: silence active chunks, forget them, unset the cursor.
    ///
    /// Returns the number of chunks that were cut off.
    pub fn flush(&mut self) -> usize {
        for id in self.active.keys() {
            self.sink.stop(*id);
        }
        let flushed = self.active.len();
        self.active.clear();
        self.cursor = None;
        self.diagnostics.flushes.fetch_add(1, Ordering::Relaxed);
        self.diagnostics
            .chunks_flushed
            .fetch_add(flushed, Ordering::Relaxed);
        if flushed > 0 {
            info!(flushed, "playback flushed");
        }
        self.set_producing(false);
        flushed
    }

    /// Flush and release the output. Close errors are logged, not returned.
    pub fn shutdown(&mut self) {
        self.flush();
        if let Err(e) = self.sink.close() {
            warn!(error = %e, "error while closing playback output (ignored)");
        }
    }

    pub fn is_producing(&self) -> bool {
        self.producing
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn cursor(&self) -> Option<f64> {
        self.cursor
    }

    pub fn now(&self) -> f64 {
        self.sink.now()
    }

    fn set_producing(&mut self, producing: bool) {
        if self.producing == producing {
            return;
        }
        self.producing = producing;
        let event = PlaybackActivityEvent {
            seq: self.activity_seq,
            producing,
            active_chunks: self.active.len(),
        };
        self.activity_seq = self.activity_seq.saturating_add(1);
        let _ = self.activity_tx.send(event);
    }
}
