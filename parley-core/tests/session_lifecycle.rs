use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    mpsc as std_mpsc, Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use parley_core::buffering::{chunk::PlaybackChunk, frame::AudioFrame, AudioProducer, Producer};
use parley_core::{
    codec, EngineConfig, InputStream, Microphone, OutputClock, OutputDevice, ParleyError,
    PlaybackSink, Result, SessionConfig, SessionController, SessionState, SessionTransport,
    TransportEventSender, TransportHandle,
};
use tokio::sync::broadcast::{self, error::TryRecvError};

// ── Fakes ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeMicrophone {
    deny: AtomicBool,
    /// When set, `acquire` blocks until the sender fires or is dropped.
    gate: Mutex<Option<std_mpsc::Receiver<()>>>,
    producer: Mutex<Option<AudioProducer>>,
    acquisitions: AtomicUsize,
    live_streams: Arc<AtomicUsize>,
}

impl FakeMicrophone {
    fn push(&self, samples: &[f32]) {
        let mut slot = self.producer.lock();
        let producer = slot.as_mut().expect("microphone not acquired");
        assert_eq!(producer.push_slice(samples), samples.len());
    }
}

struct FakeStream {
    live: Arc<AtomicUsize>,
}

impl InputStream for FakeStream {
    fn sample_rate(&self) -> u32 {
        16_000
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Microphone for FakeMicrophone {
    fn acquire(
        &self,
        producer: AudioProducer,
        _running: Arc<AtomicBool>,
    ) -> Result<Box<dyn InputStream>> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(ParleyError::PermissionDenied("user refused access".into()));
        }
        *self.producer.lock() = Some(producer);
        self.live_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            live: Arc::clone(&self.live_streams),
        }))
    }
}

#[derive(Default)]
struct ManualSink {
    now: Mutex<f64>,
    scheduled: Mutex<Vec<(u64, f64)>>,
    stopped: Mutex<Vec<u64>>,
    closed: AtomicUsize,
}

impl OutputClock for ManualSink {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

impl PlaybackSink for ManualSink {
    fn schedule(&self, chunk: PlaybackChunk) -> Result<()> {
        self.scheduled.lock().push((chunk.id, chunk.scheduled_start));
        Ok(())
    }

    fn stop(&self, id: u64) {
        self.stopped.lock().push(id);
    }

    fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeOutput {
    sink: Arc<ManualSink>,
    opens: AtomicUsize,
}

impl OutputDevice for FakeOutput {
    fn open(&self, _sample_rate: u32) -> Result<Arc<dyn PlaybackSink>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let sink: Arc<dyn PlaybackSink> = self.sink.clone();
        Ok(sink)
    }
}

#[derive(Default)]
struct RecordingHandle {
    frames: Mutex<Vec<u64>>,
    closes: AtomicUsize,
    fail: AtomicBool,
}

impl TransportHandle for RecordingHandle {
    fn send(&self, frame: &AudioFrame) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ParleyError::SendFailed("socket reset".into()));
        }
        self.frames.lock().push(frame.seq);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        // Closing an already-broken channel reports an error the controller must ignore.
        Err(ParleyError::Connection("already closed".into()))
    }
}

#[derive(Default)]
struct ScriptedTransport {
    /// Emit `Opened` from inside `open`.
    open_immediately: AtomicBool,
    sessions: Mutex<Vec<(TransportEventSender, Arc<RecordingHandle>)>>,
}

impl ScriptedTransport {
    fn opens(&self) -> usize {
        self.sessions.lock().len()
    }

    fn events(&self) -> TransportEventSender {
        self.sessions.lock().last().expect("no session opened").0.clone()
    }

    fn handle(&self) -> Arc<RecordingHandle> {
        Arc::clone(&self.sessions.lock().last().expect("no session opened").1)
    }
}

impl SessionTransport for ScriptedTransport {
    fn open(
        &self,
        _config: &SessionConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn TransportHandle>> {
        if self.open_immediately.load(Ordering::SeqCst) {
            events.opened();
        }
        let handle = Arc::new(RecordingHandle::default());
        self.sessions.lock().push((events, Arc::clone(&handle)));
        let handle: Arc<dyn TransportHandle> = handle;
        Ok(handle)
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Rig {
    controller: Arc<SessionController>,
    mic: Arc<FakeMicrophone>,
    output: Arc<FakeOutput>,
    transport: Arc<ScriptedTransport>,
}

fn rig() -> Rig {
    let mic = Arc::new(FakeMicrophone::default());
    let output = Arc::new(FakeOutput::default());
    let transport = Arc::new(ScriptedTransport::default());
    transport.open_immediately.store(true, Ordering::SeqCst);
    let config = EngineConfig {
        frame_samples: 512,
        completion_poll_ms: 2,
        ..EngineConfig::default()
    };
    let controller = Arc::new(SessionController::new(
        config,
        mic.clone(),
        output.clone(),
        transport.clone(),
    ));
    Rig {
        controller,
        mic,
        output,
        transport,
    }
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

async fn streaming_rig() -> Rig {
    let rig = rig();
    rig.controller
        .start(SessionConfig::default())
        .await
        .expect("start");
    let controller = Arc::clone(&rig.controller);
    wait_for("streaming", || controller.state() == SessionState::Streaming).await;
    rig
}

fn half_second_chunk() -> Vec<u8> {
    codec::encode(&vec![0.1; 12_000])
}

fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => out.push(ev),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn open_event_moves_to_streaming_and_frames_flow() {
    let rig = rig();
    rig.transport.open_immediately.store(false, Ordering::SeqCst);
    let mut states = rig.controller.subscribe_state();

    rig.controller.start(SessionConfig::default()).await.unwrap();
    assert_eq!(rig.controller.state(), SessionState::Connecting);

    // Frames captured before the transport is open are dropped, not queued.
    rig.mic.push(&vec![0.2; 512 * 2]);
    let controller = Arc::clone(&rig.controller);
    wait_for("pre-open frames", || {
        controller.pipeline_diagnostics_snapshot().frames_dropped_not_open == 2
    })
    .await;

    rig.transport.events().opened();
    let controller = Arc::clone(&rig.controller);
    wait_for("streaming", || controller.state() == SessionState::Streaming).await;

    rig.mic.push(&vec![0.2; 512 * 3]);
    let handle = rig.transport.handle();
    wait_for("frames", || handle.frames.lock().len() == 3).await;
    assert_eq!(&*handle.frames.lock(), &vec![2, 3, 4]);

    let seen: Vec<SessionState> = drain(&mut states).into_iter().map(|e| e.state).collect();
    assert_eq!(seen, vec![SessionState::Connecting, SessionState::Streaming]);
    rig.controller.stop();
}

#[tokio::test]
async fn three_chunks_play_back_to_back_then_go_quiet() {
    let rig = streaming_rig().await;
    let mut activity = rig.controller.subscribe_activity();
    let events = rig.transport.events();

    for _ in 0..3 {
        events.chunk(half_second_chunk());
    }
    let sink = Arc::clone(&rig.output.sink);
    wait_for("three scheduled chunks", || sink.scheduled.lock().len() == 3).await;
    let starts: Vec<f64> = sink.scheduled.lock().iter().map(|(_, s)| *s).collect();
    assert_eq!(starts, vec![0.0, 0.5, 1.0]);
    assert!(rig.controller.is_producing());

    *sink.now.lock() = 1.2;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rig.controller.is_producing());

    *sink.now.lock() = 1.5;
    let controller = Arc::clone(&rig.controller);
    wait_for("quiet", || !controller.is_producing()).await;

    let transitions: Vec<bool> = drain(&mut activity).into_iter().map(|e| e.producing).collect();
    assert_eq!(transitions, vec![true, false]);
    assert_eq!(rig.controller.playback_diagnostics_snapshot().chunks_completed, 3);
    rig.controller.stop();
}

#[tokio::test]
async fn interrupt_stops_playback_and_resets_cursor() {
    let rig = streaming_rig().await;
    let events = rig.transport.events();
    let sink = Arc::clone(&rig.output.sink);

    events.chunk(half_second_chunk());
    wait_for("scheduled", || sink.scheduled.lock().len() == 1).await;
    assert!(rig.controller.is_producing());

    *sink.now.lock() = 0.2;
    // Interrupt and new audio in one server message: the interrupt goes first.
    events.server_message(true, Some(half_second_chunk()));
    wait_for("post-interrupt chunk", || sink.scheduled.lock().len() == 2).await;

    assert_eq!(&*sink.stopped.lock(), &vec![0]);
    assert_eq!(sink.scheduled.lock()[1].1, 0.2);
    assert_eq!(rig.controller.playback_diagnostics_snapshot().interrupts, 1);

    events.interrupted();
    let controller = Arc::clone(&rig.controller);
    wait_for("silence", || !controller.is_producing()).await;
    rig.controller.stop();
}

#[tokio::test]
async fn malformed_chunk_is_dropped_and_session_continues() {
    let rig = streaming_rig().await;
    let mut diagnostics = rig.controller.subscribe_diagnostics();
    let events = rig.transport.events();

    events.chunk(vec![1, 2, 3]);
    events.chunk(half_second_chunk());
    let sink = Arc::clone(&rig.output.sink);
    wait_for("valid chunk", || sink.scheduled.lock().len() == 1).await;

    let dropped = drain(&mut diagnostics);
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].bytes, 3);
    assert_eq!(rig.controller.state(), SessionState::Streaming);
    assert_eq!(rig.controller.last_error(), None);
    rig.controller.stop();
}

#[tokio::test]
async fn stop_twice_releases_everything_once() {
    let rig = streaming_rig().await;
    rig.transport.events().chunk(half_second_chunk());
    let sink = Arc::clone(&rig.output.sink);
    wait_for("scheduled", || sink.scheduled.lock().len() == 1).await;

    rig.controller.stop();
    rig.controller.stop();

    assert_eq!(rig.controller.state(), SessionState::Idle);
    assert!(!rig.controller.is_producing());
    assert_eq!(rig.transport.handle().closes.load(Ordering::SeqCst), 1);
    assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
    assert_eq!(&*sink.stopped.lock(), &vec![0]);
    // The microphone is already released when stop() returns.
    assert_eq!(rig.mic.live_streams.load(Ordering::SeqCst), 0);
    assert_eq!(rig.controller.last_error(), None);
}

#[tokio::test]
async fn stop_while_microphone_pending_absorbs_late_grant() {
    let rig = rig();
    let (release, gate) = std_mpsc::channel();
    *rig.mic.gate.lock() = Some(gate);

    let controller = Arc::clone(&rig.controller);
    let start = tokio::spawn(async move { controller.start(SessionConfig::default()).await });

    let mic = Arc::clone(&rig.mic);
    wait_for("permission prompt", || mic.acquisitions.load(Ordering::SeqCst) == 1).await;
    assert_eq!(rig.controller.state(), SessionState::Connecting);

    rig.controller.stop();
    assert_eq!(rig.controller.state(), SessionState::Idle);

    release.send(()).unwrap();
    let result = start.await.unwrap();
    assert!(matches!(result, Err(ParleyError::Cancelled)));

    assert_eq!(rig.controller.state(), SessionState::Idle);
    assert_eq!(rig.transport.opens(), 0);
    assert_eq!(rig.output.opens.load(Ordering::SeqCst), 0);
    let mic = Arc::clone(&rig.mic);
    wait_for("late stream released", || mic.live_streams.load(Ordering::SeqCst) == 0).await;
}

#[tokio::test]
async fn denied_microphone_ends_idle_with_reason() {
    let rig = rig();
    rig.mic.deny.store(true, Ordering::SeqCst);
    let mut states = rig.controller.subscribe_state();

    let result = rig.controller.start(SessionConfig::default()).await;
    assert!(matches!(result, Err(ParleyError::PermissionDenied(_))));
    assert_eq!(rig.controller.state(), SessionState::Idle);
    assert!(rig
        .controller
        .last_error()
        .is_some_and(|e| e.contains("permission denied")));
    assert_eq!(rig.transport.opens(), 0);

    let seen: Vec<SessionState> = drain(&mut states).into_iter().map(|e| e.state).collect();
    assert_eq!(
        seen,
        vec![
            SessionState::Connecting,
            SessionState::Error,
            SessionState::Closing,
            SessionState::Idle
        ]
    );
}

#[tokio::test]
async fn transport_failure_tears_down_session() {
    let rig = streaming_rig().await;
    rig.transport.events().failed("billing not enabled");

    let controller = Arc::clone(&rig.controller);
    wait_for("idle", || controller.state() == SessionState::Idle).await;
    assert!(rig
        .controller
        .last_error()
        .is_some_and(|e| e.contains("billing not enabled")));
    assert_eq!(rig.transport.handle().closes.load(Ordering::SeqCst), 1);
    assert_eq!(rig.output.sink.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn abnormal_close_is_an_error_normal_close_is_not() {
    let rig = streaming_rig().await;
    rig.transport.events().closed(1006, "abnormal closure");
    let controller = Arc::clone(&rig.controller);
    wait_for("idle", || controller.state() == SessionState::Idle).await;
    assert!(rig
        .controller
        .last_error()
        .is_some_and(|e| e.contains("1006")));

    rig.controller.start(SessionConfig::default()).await.unwrap();
    assert_eq!(rig.controller.last_error(), None);
    wait_for("streaming", || controller.state() == SessionState::Streaming).await;
    rig.transport.events().closed(1000, "bye");
    wait_for("idle again", || controller.state() == SessionState::Idle).await;
    assert_eq!(rig.controller.last_error(), None);
}

#[tokio::test]
async fn start_while_streaming_replaces_the_session() {
    let rig = streaming_rig().await;
    let first = rig.transport.handle();

    rig.controller.start(SessionConfig::default()).await.unwrap();
    let controller = Arc::clone(&rig.controller);
    wait_for("streaming", || controller.state() == SessionState::Streaming).await;

    assert_eq!(rig.transport.opens(), 2);
    assert_eq!(first.closes.load(Ordering::SeqCst), 1);
    assert_eq!(rig.mic.live_streams.load(Ordering::SeqCst), 1);

    // Events on the old session's channel are ignored.
    rig.transport.sessions.lock()[0].0.failed("stale");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(rig.controller.state(), SessionState::Streaming);
    rig.controller.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_starts_leave_exactly_one_session() {
    for _ in 0..20 {
        let rig = rig();
        let a = Arc::clone(&rig.controller);
        let b = Arc::clone(&rig.controller);
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.start(SessionConfig::default()).await }),
            tokio::spawn(async move { b.start(SessionConfig::default()).await }),
        );
        let results = [ra.unwrap(), rb.unwrap()];
        assert!(results.iter().any(|r| r.is_ok()));
        for r in &results {
            assert!(matches!(r, Ok(()) | Err(ParleyError::Cancelled)), "{r:?}");
        }

        let controller = Arc::clone(&rig.controller);
        wait_for("streaming", || controller.state() == SessionState::Streaming).await;
        let mic = Arc::clone(&rig.mic);
        wait_for("one live stream", || mic.live_streams.load(Ordering::SeqCst) == 1).await;
        assert_eq!(rig.mic.acquisitions.load(Ordering::SeqCst), 2);

        rig.controller.stop();
        assert_eq!(rig.mic.live_streams.load(Ordering::SeqCst), 0);
        assert_eq!(rig.controller.state(), SessionState::Idle);
    }
}

#[tokio::test]
async fn send_failure_stops_the_session() {
    let rig = streaming_rig().await;
    rig.transport.handle().fail.store(true, Ordering::SeqCst);

    rig.mic.push(&vec![0.1; 512]);
    let controller = Arc::clone(&rig.controller);
    wait_for("idle", || controller.state() == SessionState::Idle).await;
    assert!(rig
        .controller
        .last_error()
        .is_some_and(|e| e.contains("socket reset")));
    let mic = Arc::clone(&rig.mic);
    wait_for("microphone release", || mic.live_streams.load(Ordering::SeqCst) == 0).await;
}

#[tokio::test]
async fn muted_frames_are_never_sent() {
    let rig = streaming_rig().await;
    let handle = rig.transport.handle();

    rig.controller.set_muted(true);
    assert!(rig.controller.is_muted());
    rig.mic.push(&vec![0.1; 512 * 3]);
    let controller = Arc::clone(&rig.controller);
    wait_for("muted frames", || {
        controller.pipeline_diagnostics_snapshot().frames_muted == 3
    })
    .await;
    assert!(handle.frames.lock().is_empty());

    rig.controller.set_muted(false);
    rig.mic.push(&vec![0.1; 512]);
    wait_for("unmuted frame", || handle.frames.lock().len() == 1).await;
    assert_eq!(&*handle.frames.lock(), &vec![3]);
    rig.controller.stop();
}
