//! Blocking capture loop.
//!
//! ## Stages (per iteration)
//!
//! ```text
//! 1. Drain ring buffer → raw samples at the device rate
//! 2. Resample to the wire input rate (passthrough when equal)
//! 3. FrameAssembler slices fixed-size frames on the capture clock
//! 4. Per frame: muted → drop; else encode PCM16 and offer to the OutboundLink
//!    (dropped silently when no session is open)
//! 5. A send error stops the loop and is reported on the fatal channel
//! ```
//!
//! This loop runs in `spawn_blocking` on the same thread that owns the
//! microphone stream, keeping the Tokio executor free for transport I/O.

use std::sync::OnceLock;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    audio::resample::RateConverter,
    buffering::{
        frame::{AudioFrame, FrameAssembler},
        AudioConsumer, Consumer,
    },
    engine::EngineConfig,
    error::{ParleyError, Result},
    transport::{OutboundLink, SendOutcome},
};

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub samples_in: AtomicUsize,
    pub frames_captured: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub frames_muted: AtomicUsize,
    pub frames_dropped_not_open: AtomicUsize,
    pub send_failures: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.samples_in.store(0, Ordering::Relaxed);
        self.frames_captured.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_muted.store(0, Ordering::Relaxed);
        self.frames_dropped_not_open.store(0, Ordering::Relaxed);
        self.send_failures.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_muted: self.frames_muted.load(Ordering::Relaxed),
            frames_dropped_not_open: self.frames_dropped_not_open.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub samples_in: usize,
    pub frames_captured: usize,
    pub frames_sent: usize,
    pub frames_muted: usize,
    pub frames_dropped_not_open: usize,
    pub send_failures: usize,
}

/// All context the pipeline needs, passed as one struct so the closure stays tidy.
pub struct PipelineContext {
    pub config: EngineConfig,
    pub consumer: AudioConsumer,
    /// Cleared by the controller on teardown, or by the loop itself on a send failure.
    pub running: Arc<AtomicBool>,
    pub muted: Arc<AtomicBool>,
    pub outbound: Arc<OutboundLink>,
    /// Session-fatal errors raised on this thread.
    pub fatal_tx: mpsc::UnboundedSender<ParleyError>,
    pub capture_sample_rate: u32,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Chunk size drained from the ring buffer per iteration.
/// 20 ms at 48 kHz = 960 samples.
const DRAIN_CHUNK: usize = 960;

/// Minimum sleep when the ring is empty (avoids busy-wait burning a core).
const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

/// Run the blocking capture loop until `ctx.running` becomes false.
pub fn run(mut ctx: PipelineContext) {
    info!(
        capture_rate = ctx.capture_sample_rate,
        wire_rate = ctx.config.input_sample_rate,
        frame_samples = ctx.config.frame_samples,
        "capture pipeline started"
    );

    let mut resampler = match RateConverter::new(
        ctx.capture_sample_rate,
        ctx.config.input_sample_rate,
        DRAIN_CHUNK,
    ) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to create resampler: {e}");
            ctx.running.store(false, Ordering::SeqCst);
            let _ = ctx.fatal_tx.send(e);
            return;
        }
    };

    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut assembler = FrameAssembler::new(ctx.config.frame_samples);
    let mut next_seq = 0u64;

    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(std::time::Duration::from_millis(empty_sleep_ms()));
            continue;
        }
        ctx.diagnostics.samples_in.fetch_add(n, Ordering::Relaxed);

        let resampled = resampler.process(&raw[..n]);
        if resampled.is_empty() {
            continue;
        }

        let mut failure: Option<ParleyError> = None;
        assembler.push(&resampled, |samples| {
            if failure.is_some() || !ctx.running.load(Ordering::Relaxed) {
                return;
            }
            let seq = next_seq;
            next_seq += 1;
            if let Err(e) = deliver_frame(&ctx, seq, samples) {
                failure = Some(e);
            }
        });

        if let Some(e) = failure {
            error!(error = %e, "outbound send failed, stopping capture");
            ctx.running.store(false, Ordering::SeqCst);
            let _ = ctx.fatal_tx.send(e);
            break;
        }
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        samples_in = snap.samples_in,
        frames_captured = snap.frames_captured,
        frames_sent = snap.frames_sent,
        frames_muted = snap.frames_muted,
        frames_dropped_not_open = snap.frames_dropped_not_open,
        send_failures = snap.send_failures,
        "capture pipeline stopped, diagnostics"
    );
}

/// Mute check, encode, and best-effort send of one completed frame.
fn deliver_frame(ctx: &PipelineContext, seq: u64, samples: &[f32]) -> Result<()> {
    ctx.diagnostics
        .frames_captured
        .fetch_add(1, Ordering::Relaxed);

    if ctx.muted.load(Ordering::Relaxed) {
        ctx.diagnostics.frames_muted.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }

    let frame = AudioFrame::encode(seq, samples, ctx.config.input_sample_rate);
    match ctx.outbound.send(&frame) {
        Ok(SendOutcome::Sent) => {
            ctx.diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
            debug!(
                seq,
                bytes = frame.pcm.len(),
                secs = frame.duration_secs(),
                "frame sent"
            );
            Ok(())
        }
        Ok(SendOutcome::NotOpen) => {
            ctx.diagnostics
                .frames_dropped_not_open
                .fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(e) => {
            ctx.diagnostics.send_failures.fetch_add(1, Ordering::Relaxed);
            warn!(seq, "frame send failed: {e}");
            Err(e)
        }
    }
}

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("PARLEY_PIPELINE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}
