//! `SessionController`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! SessionController::new()
//!     └─► start(config)   → Connecting: mic acquired, output opened, transport opening
//!         └─► Opened      → Streaming: outbound frames flow, inbound chunks play
//!             └─► stop()  → Closing → Idle: everything released
//!
//! any terminal failure    → Error(reason) → Closing → Idle
//! ```
//!
//! `stop()` is idempotent and safe to call from anywhere, including while
//! `start()` is still waiting on the microphone. It returns once the
//! microphone stream has been dropped and the output released; concurrent
//! calls are serialised, so every caller returns to an `Idle` controller.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread affinity).
//! The microphone is therefore acquired *inside* the `spawn_blocking` closure
//! that then runs the capture pipeline, so the stream never crosses a thread
//! boundary. A oneshot channel carries the acquisition result back to `start()`.
//!
//! Transport events, capture failures and the playback completion poll are
//! consumed by one async task per session, the single writer of the
//! `PlaybackScheduler`.
//!
//! ## Stale results
//!
//! Every session gets a new generation number. Each async step of `start()`
//! and every event handler checks its generation before acting, so a grant or
//! event belonging to a stopped session is absorbed instead of resurrecting it.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    audio::Microphone,
    buffering::create_audio_ring,
    error::{ParleyError, Result},
    ipc::events::{
        PayloadDiagnosticEvent, PlaybackActivityEvent, SessionState, SessionStateEvent,
    },
    playback::{
        OutputDevice, PlaybackDiagnostics, PlaybackDiagnosticsSnapshot, PlaybackScheduler,
    },
    transport::{
        OutboundLink, SessionConfig, SessionTransport, TransportEvent, TransportEventReceiver,
        TransportEventSender, TransportHandle, NORMAL_CLOSE_CODE,
    },
};

/// Broadcast channel capacity for slow subscribers.
const BROADCAST_CAP: usize = 256;

/// Upper bound on waiting for the capture thread to drop the microphone.
const CAPTURE_RELEASE_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for `SessionController`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Outbound wire rate (Hz). Captured audio is resampled to this. Default: 16000.
    pub input_sample_rate: u32,
    /// Inbound wire rate (Hz) of received chunks. Default: 24000.
    pub output_sample_rate: u32,
    /// Samples per outbound frame at `input_sample_rate`. Default: 4096.
    pub frame_samples: usize,
    /// How often natural chunk completion is checked against the output
    /// clock (ms). Default: 10.
    pub completion_poll_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_samples: 4_096,
            completion_poll_ms: 10,
        }
    }
}

/// Control side of one session's capture thread.
struct CaptureHandle {
    running: Arc<AtomicBool>,
    /// Set by the capture thread once it holds a microphone stream.
    acquired: Arc<AtomicBool>,
    /// Never carries a message; disconnects when the capture thread exits.
    released: crossbeam_channel::Receiver<()>,
}

impl CaptureHandle {
    /// The handle plus the sender the capture thread keeps until it exits.
    fn new() -> (Self, crossbeam_channel::Sender<()>) {
        let (released_tx, released) = crossbeam_channel::bounded(0);
        let handle = Self {
            running: Arc::new(AtomicBool::new(true)),
            acquired: Arc::new(AtomicBool::new(false)),
            released,
        };
        (handle, released_tx)
    }

    /// Clear `running` and, if a stream was acquired, wait for it to drop.
    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if !self.acquired.load(Ordering::SeqCst) {
            return;
        }
        if let Err(crossbeam_channel::RecvTimeoutError::Timeout) =
            self.released.recv_timeout(CAPTURE_RELEASE_TIMEOUT)
        {
            warn!(
                timeout_ms = CAPTURE_RELEASE_TIMEOUT.as_millis() as u64,
                "capture thread still holds the microphone"
            );
        }
    }
}

/// Resources owned by the one live session.
struct ActiveSession {
    generation: u64,
    capture: CaptureHandle,
    transport: Option<Arc<dyn TransportHandle>>,
    event_task: Option<tokio::task::AbortHandle>,
}

/// State shared between the controller, its event task and the capture thread.
struct Shared {
    config: EngineConfig,
    state: Mutex<SessionState>,
    generation: AtomicU64,
    last_error: Mutex<Option<String>>,
    muted: Arc<AtomicBool>,
    outbound: Arc<OutboundLink>,
    /// Serialises session handover and teardown. Taken before `session`.
    lifecycle: Mutex<()>,
    session: Mutex<Option<ActiveSession>>,
    /// Tagged with the generation that installed it.
    scheduler: Mutex<Option<(u64, PlaybackScheduler)>>,
    state_tx: broadcast::Sender<SessionStateEvent>,
    activity_tx: broadcast::Sender<PlaybackActivityEvent>,
    payload_tx: broadcast::Sender<PayloadDiagnosticEvent>,
    payload_seq: AtomicU64,
    pipeline_diagnostics: Arc<pipeline::PipelineDiagnostics>,
    playback_diagnostics: Arc<PlaybackDiagnostics>,
}

/// The top-level session handle.
///
/// `SessionController` is `Send + Sync`; all fields use interior mutability.
/// Wrap in `Arc<SessionController>` to share between a UI and event-forwarding
/// tasks. Must be used from within a Tokio runtime.
pub struct SessionController {
    microphone: Arc<dyn Microphone>,
    output: Arc<dyn OutputDevice>,
    transport: Arc<dyn SessionTransport>,
    shared: Arc<Shared>,
}

impl SessionController {
    /// Create a controller. Nothing is opened until `start()`.
    pub fn new(
        config: EngineConfig,
        microphone: Arc<dyn Microphone>,
        output: Arc<dyn OutputDevice>,
        transport: Arc<dyn SessionTransport>,
    ) -> Self {
        Self {
            microphone,
            output,
            transport,
            shared: Arc::new(Shared::new(config)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Start a session.
    ///
    /// Any live session is stopped first. Returns once the microphone, the
    /// output and the transport have been acquired; the controller moves to
    /// `Streaming` when the transport reports it is open.
    ///
    /// # Errors
    /// - `ParleyError::PermissionDenied` / device errors if the microphone or
    ///   output cannot be opened.
    /// - `ParleyError::Connection` if the transport refuses to open.
    /// - `ParleyError::Cancelled` if `stop()` was called before start finished.
    ///
    /// On every error the controller is back in `Idle` with all resources released.
    pub async fn start(&self, session_config: SessionConfig) -> Result<()> {
        let (capture, released_tx) = CaptureHandle::new();
        let running = Arc::clone(&capture.running);
        let acquired = Arc::clone(&capture.acquired);
        let generation = self.shared.begin_session(capture);

        // ── 1. Microphone + capture thread ───────────────────────────────────
        let (producer, consumer) = create_audio_ring();
        let (open_tx, open_rx) = oneshot::channel::<Result<u32>>();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let microphone = Arc::clone(&self.microphone);
        let config = self.shared.config.clone();
        let muted = Arc::clone(&self.shared.muted);
        let outbound = Arc::clone(&self.shared.outbound);
        let diagnostics = Arc::clone(&self.shared.pipeline_diagnostics);

        tokio::task::spawn_blocking(move || {
            // Declared first so it drops after the stream.
            let _released = released_tx;

            // Must happen on THIS thread: the stream is not Send.
            let stream = match microphone.acquire(producer, Arc::clone(&running)) {
                Ok(stream) => stream,
                Err(e) => {
                    running.store(false, Ordering::SeqCst);
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
            acquired.store(true, Ordering::SeqCst);

            let capture_sample_rate = stream.sample_rate();
            if open_tx.send(Ok(capture_sample_rate)).is_err() || !running.load(Ordering::SeqCst) {
                info!("microphone granted after session ended, releasing");
                return;
            }

            pipeline::run(pipeline::PipelineContext {
                config,
                consumer,
                running,
                muted,
                outbound,
                fatal_tx,
                capture_sample_rate,
                diagnostics,
            });

            // Stream drops here, releasing the microphone on this thread.
            drop(stream);
        });

        match open_rx.await {
            Ok(Ok(rate)) => debug!(generation, capture_rate = rate, "microphone acquired"),
            Ok(Err(e)) => return Err(self.abort_start(generation, e)),
            Err(_) => {
                return Err(self.abort_start(
                    generation,
                    ParleyError::Other(anyhow::anyhow!("capture thread died unexpectedly")),
                ))
            }
        }
        if !self.shared.is_current(generation) {
            info!(generation, "session stopped while acquiring microphone");
            return Err(ParleyError::Cancelled);
        }

        // ── 2. Output device + playback scheduler ────────────────────────────
        let output = Arc::clone(&self.output);
        let output_rate = self.shared.config.output_sample_rate;
        let sink = match tokio::task::spawn_blocking(move || output.open(output_rate)).await {
            Ok(Ok(sink)) => sink,
            Ok(Err(e)) => return Err(self.abort_start(generation, e)),
            Err(join) => {
                return Err(self.abort_start(
                    generation,
                    ParleyError::Other(anyhow::anyhow!("output open task failed: {join}")),
                ))
            }
        };
        let scheduler = PlaybackScheduler::new(
            sink,
            output_rate,
            self.shared.activity_tx.clone(),
            Arc::clone(&self.shared.playback_diagnostics),
        );
        if let Err(mut scheduler) = self.shared.install_scheduler(generation, scheduler) {
            scheduler.shutdown();
            return Err(ParleyError::Cancelled);
        }

        // ── 3. Transport ─────────────────────────────────────────────────────
        let (events, events_rx) = TransportEventSender::channel();
        let handle = match self.transport.open(&session_config, events) {
            Ok(handle) => handle,
            Err(e) => return Err(self.abort_start(generation, e)),
        };
        if !self.shared.attach_transport(generation, Arc::clone(&handle)) {
            let _ = handle.close();
            return Err(ParleyError::Cancelled);
        }

        // ── 4. Event task ────────────────────────────────────────────────────
        let task = tokio::spawn(event_loop(
            Arc::clone(&self.shared),
            generation,
            events_rx,
            fatal_rx,
        ));
        if !self.shared.attach_event_task(generation, &task) {
            task.abort();
            return Err(ParleyError::Cancelled);
        }

        info!(generation, "session connecting");
        Ok(())
    }

    /// Tear down the live session, if any. Idempotent.
    ///
    /// Order: outbound frames stop, transport closes, microphone is released,
    /// playback is flushed, state returns to `Idle`. Blocks until the capture
    /// thread has dropped the microphone stream (bounded by a short timeout).
    pub fn stop(&self) {
        self.shared.teardown(None, None);
    }

    /// Mute or un-mute outbound audio. Takes effect on the next frame.
    pub fn set_muted(&self, muted: bool) {
        let was = self.shared.muted.swap(muted, Ordering::SeqCst);
        if was != muted {
            info!(muted, "outbound audio mute changed");
        }
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::SeqCst)
    }

    /// Current session state (snapshot).
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// Whether model speech is currently scheduled or playing.
    pub fn is_producing(&self) -> bool {
        self.shared
            .scheduler
            .lock()
            .as_ref()
            .is_some_and(|(_, scheduler)| scheduler.is_producing())
    }

    /// Reason the most recent session ended on an error, until the next `start()`.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Subscribe to session state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<SessionStateEvent> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to "producing sound" transitions.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<PlaybackActivityEvent> {
        self.shared.activity_tx.subscribe()
    }

    /// Subscribe to dropped-chunk diagnostics.
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<PayloadDiagnosticEvent> {
        self.shared.payload_tx.subscribe()
    }

    /// Snapshot of capture counters for the current or last session.
    pub fn pipeline_diagnostics_snapshot(&self) -> pipeline::DiagnosticsSnapshot {
        self.shared.pipeline_diagnostics.snapshot()
    }

    /// Snapshot of playback counters for the current or last session.
    pub fn playback_diagnostics_snapshot(&self) -> PlaybackDiagnosticsSnapshot {
        self.shared.playback_diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    /// Turn a failed acquisition into the error `start()` returns.
    fn abort_start(&self, generation: u64, err: ParleyError) -> ParleyError {
        if self.shared.is_current(generation) {
            self.shared.teardown(Some(generation), Some(&err));
            err
        } else {
            debug!(generation, error = %err, "acquisition failed after session ended");
            ParleyError::Cancelled
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shared.teardown(None, None);
    }
}

impl Shared {
    fn new(config: EngineConfig) -> Self {
        let (state_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (payload_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config,
            state: Mutex::new(SessionState::Idle),
            generation: AtomicU64::new(0),
            last_error: Mutex::new(None),
            muted: Arc::new(AtomicBool::new(false)),
            outbound: Arc::new(OutboundLink::new()),
            lifecycle: Mutex::new(()),
            session: Mutex::new(None),
            scheduler: Mutex::new(None),
            state_tx,
            activity_tx,
            payload_tx,
            payload_seq: AtomicU64::new(0),
            pipeline_diagnostics: Arc::new(pipeline::PipelineDiagnostics::default()),
            playback_diagnostics: Arc::new(PlaybackDiagnostics::default()),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, state: SessionState, detail: Option<String>) {
        *self.state.lock() = state;
        info!(?state, detail = detail.as_deref().unwrap_or(""), "session state");
        let _ = self.state_tx.send(SessionStateEvent { state, detail });
    }

    /// Retire any live session, then install a new one in `Connecting`.
    ///
    /// Holding `lifecycle` across both steps means two racing starts cannot
    /// both find the slot empty.
    fn begin_session(&self, capture: CaptureHandle) -> u64 {
        let _lifecycle = self.lifecycle.lock();
        let previous = self.retire(&mut self.session.lock(), None, None);
        if let Some(previous) = previous {
            info!(
                generation = previous.generation,
                "start requested while a session is live, stopping it first"
            );
            self.release(previous);
        }

        let mut slot = self.session.lock();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_error.lock() = None;
        self.pipeline_diagnostics.reset();
        self.playback_diagnostics.reset();
        *slot = Some(ActiveSession {
            generation,
            capture,
            transport: None,
            event_task: None,
        });
        self.set_state(SessionState::Connecting, None);
        generation
    }

    /// Install the scheduler unless the session has already ended.
    fn install_scheduler(
        &self,
        generation: u64,
        scheduler: PlaybackScheduler,
    ) -> std::result::Result<(), PlaybackScheduler> {
        let slot = self.session.lock();
        if !slot.as_ref().is_some_and(|s| s.generation == generation) {
            return Err(scheduler);
        }
        *self.scheduler.lock() = Some((generation, scheduler));
        Ok(())
    }

    fn attach_transport(&self, generation: u64, handle: Arc<dyn TransportHandle>) -> bool {
        let mut slot = self.session.lock();
        match slot.as_mut() {
            Some(session) if session.generation == generation => {
                session.transport = Some(handle);
                true
            }
            _ => false,
        }
    }

    fn attach_event_task(&self, generation: u64, task: &tokio::task::JoinHandle<()>) -> bool {
        let mut slot = self.session.lock();
        match slot.as_mut() {
            Some(session) if session.generation == generation => {
                session.event_task = Some(task.abort_handle());
                true
            }
            _ => false,
        }
    }

    /// Run `f` against the scheduler of `generation`, if it is still installed.
    fn with_scheduler<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut PlaybackScheduler) -> R,
    ) -> Option<R> {
        let mut slot = self.scheduler.lock();
        match slot.as_mut() {
            Some((g, scheduler)) if *g == generation => Some(f(scheduler)),
            _ => None,
        }
    }

    /// Transport reported open: start sending frames and go `Streaming`.
    fn on_opened(&self, generation: u64) {
        let slot = self.session.lock();
        let Some(session) = slot.as_ref().filter(|s| s.generation == generation) else {
            return;
        };
        let Some(handle) = session.transport.as_ref() else {
            return;
        };
        self.outbound.attach(Arc::clone(handle));
        self.set_state(SessionState::Streaming, None);
    }

    /// Dispatch one transport event. Returns `false` once the session is over.
    fn handle_event(&self, generation: u64, event: TransportEvent) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        match event {
            TransportEvent::Opened => {
                self.on_opened(generation);
                true
            }
            TransportEvent::ChunkReceived(payload) => {
                let bytes = payload.len();
                match self.with_scheduler(generation, |s| s.admit(&payload)) {
                    None => false,
                    Some(Ok(_)) => true,
                    Some(Err(e)) if !e.is_terminal() => {
                        warn!(bytes, "dropping inbound chunk: {e}");
                        let seq = self.payload_seq.fetch_add(1, Ordering::Relaxed);
                        let _ = self.payload_tx.send(PayloadDiagnosticEvent {
                            seq,
                            reason: e.to_string(),
                            bytes,
                        });
                        true
                    }
                    Some(Err(e)) => {
                        self.teardown(Some(generation), Some(&e));
                        false
                    }
                }
            }
            TransportEvent::Interrupted => {
                self.playback_diagnostics
                    .interrupts
                    .fetch_add(1, Ordering::Relaxed);
                match self.with_scheduler(generation, |s| s.flush()) {
                    Some(flushed) => {
                        info!(generation, flushed, "remote interrupted playback");
                        true
                    }
                    None => false,
                }
            }
            TransportEvent::Failed(reason) => {
                self.teardown(Some(generation), Some(&ParleyError::Connection(reason)));
                false
            }
            TransportEvent::Closed { code, reason } => {
                if code == NORMAL_CLOSE_CODE {
                    info!(generation, reason = reason.as_str(), "transport closed normally");
                    self.teardown(Some(generation), None);
                } else {
                    let err = ParleyError::Connection(format!("closed with code {code}: {reason}"));
                    self.teardown(Some(generation), Some(&err));
                }
                false
            }
        }
    }

    /// Best-effort, total teardown of the live session.
    ///
    /// With `only_generation` set, nothing happens unless that generation is
    /// still the live one. A `failure` is recorded and published as `Error`
    /// before the session closes.
    fn teardown(&self, only_generation: Option<u64>, failure: Option<&ParleyError>) {
        let _lifecycle = self.lifecycle.lock();
        let session = self.retire(&mut self.session.lock(), only_generation, failure);
        if let Some(session) = session {
            self.release(session);
        }
    }

    /// Take the live session out of `slot` and cut it off from the outside:
    /// in-flight work is invalidated and no frame reaches the transport.
    fn retire(
        &self,
        slot: &mut Option<ActiveSession>,
        only_generation: Option<u64>,
        failure: Option<&ParleyError>,
    ) -> Option<ActiveSession> {
        let live = slot.as_ref()?.generation;
        if only_generation.is_some_and(|g| g != live) {
            return None;
        }
        let session = slot.take()?;
        // Invalidate every in-flight acquisition and event handler.
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = failure {
            let reason = err.to_string();
            error!(generation = session.generation, "session failed: {reason}");
            *self.last_error.lock() = Some(reason.clone());
            self.set_state(SessionState::Error, Some(reason));
        }
        self.set_state(SessionState::Closing, None);

        // Step 1: no frame reaches the transport after this point.
        self.outbound.detach();
        Some(session)
    }

    /// Release a retired session's resources. Called without the session lock.
    fn release(&self, session: ActiveSession) {
        // Step 2: close the transport; errors are expected on broken channels.
        if let Some(handle) = session.transport.as_ref() {
            if let Err(e) = handle.close() {
                debug!("error while closing transport (ignored): {e}");
            }
        }

        // Step 3: release the microphone.
        session.capture.stop();

        // Step 4: flush playback and release the output.
        let scheduler = {
            let mut slot = self.scheduler.lock();
            match slot.take() {
                Some((g, scheduler)) if g == session.generation => Some(scheduler),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        if let Some(mut scheduler) = scheduler {
            scheduler.shutdown();
        }

        if let Some(task) = session.event_task {
            task.abort();
        }

        // Step 5: Idle, unless a new session has already begun.
        let slot = self.session.lock();
        if slot.is_none() {
            self.set_state(SessionState::Idle, None);
        }
        info!(generation = session.generation, "session stopped");
    }
}

/// Single consumer of one session's transport events, capture failures and
/// completion ticks.
async fn event_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut events: TransportEventReceiver,
    mut fatal: mpsc::UnboundedReceiver<ParleyError>,
) {
    let period = Duration::from_millis(shared.config.completion_poll_ms.max(1));
    let mut poll = tokio::time::interval(period);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            Some(err) = fatal.recv() => {
                shared.teardown(Some(generation), Some(&err));
                break;
            }
            event = events.recv() => {
                let keep_going = match event {
                    Some(event) => shared.handle_event(generation, event),
                    None => {
                        let err = ParleyError::Connection("transport event stream ended".into());
                        shared.teardown(Some(generation), Some(&err));
                        false
                    }
                };
                if !keep_going {
                    break;
                }
            }
            _ = poll.tick() => {
                if shared.with_scheduler(generation, |s| s.reap()).is_none() {
                    break;
                }
            }
        }
    }
    debug!(generation, "session event task finished");
}
