//! Session transport abstraction.
//!
//! The remote speech session (handshake, model selection, auth) lives outside
//! this crate. The engine only needs:
//!
//! - `SessionTransport::open`: start connecting, returning a handle at once;
//! - a single-consumer stream of `TransportEvent`s (opened, inbound chunk,
//!   interrupted, failed, closed);
//! - `TransportHandle::send` / `close` on the handle.
//!
//! The `SessionController` is the sole owner of the handle. The capture thread
//! reaches it only through `OutboundLink`, whose lock is held across the
//! "is the session open?" check and the send call.

pub mod echo;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::buffering::frame::AudioFrame;
use crate::error::Result;

pub use echo::EchoTransport;

/// Close code for an orderly, expected shutdown.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Caller-supplied session parameters, passed verbatim to the transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SessionConfig {
    /// Language the user speaks.
    pub source_language: Option<String>,
    /// Language the model should answer in.
    pub target_language: Option<String>,
    /// Persona / conversation mode understood by the remote service.
    pub persona: Option<String>,
    /// Transport-specific extras.
    pub extra: serde_json::Value,
}

/// Events a transport reports to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The session is established; outbound frames may now be sent.
    Opened,
    /// One inbound PCM16 LE chunk at the output sample rate.
    ChunkReceived(Vec<u8>),
    /// The remote side detected the user talking over it.
    Interrupted,
    /// The channel failed.
    Failed(String),
    /// The channel closed.
    Closed { code: u16, reason: String },
}

impl TransportEvent {
    /// Whether this event ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::Failed(_) | TransportEvent::Closed { .. })
    }
}

pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Producer side of a session's event stream, handed to the transport on `open`.
///
/// Emitting never blocks. After the session has been torn down the receiver
/// is gone and emits report `false`.
#[derive(Debug, Clone)]
pub struct TransportEventSender {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEventSender {
    pub fn channel() -> (Self, TransportEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn opened(&self) -> bool {
        self.emit(TransportEvent::Opened)
    }

    pub fn chunk(&self, pcm: Vec<u8>) -> bool {
        self.emit(TransportEvent::ChunkReceived(pcm))
    }

    pub fn interrupted(&self) -> bool {
        self.emit(TransportEvent::Interrupted)
    }

    pub fn failed(&self, reason: impl Into<String>) -> bool {
        self.emit(TransportEvent::Failed(reason.into()))
    }

    pub fn closed(&self, code: u16, reason: impl Into<String>) -> bool {
        self.emit(TransportEvent::Closed {
            code,
            reason: reason.into(),
        })
    }

    /// Emit one decoded server message.
    ///
    /// When a message carries both an interruption flag and audio, the
    /// interruption goes first so the audio lands in an empty schedule.
    pub fn server_message(&self, interrupted: bool, audio: Option<Vec<u8>>) -> bool {
        let mut ok = true;
        if interrupted {
            ok &= self.interrupted();
        }
        if let Some(pcm) = audio {
            ok &= self.chunk(pcm);
        }
        ok
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open (or opening) remote session.
pub trait TransportHandle: Send + Sync {
    /// Send one outbound frame.
    ///
    /// Called with the `OutboundLink` lock held, so implementations must hand
    /// the frame off (queue, socket write buffer) rather than wait on the
    /// network.
    ///
    /// # Errors
    /// `ParleyError::SendFailed` if the channel is broken.
    fn send(&self, frame: &AudioFrame) -> Result<()>;

    /// Close the session. Idempotent; errors are reported but callers may ignore them.
    fn close(&self) -> Result<()>;
}

/// Factory for remote sessions.
pub trait SessionTransport: Send + Sync + 'static {
    /// Begin opening a session. Returns immediately; readiness is signalled
    /// through `TransportEvent::Opened` on `events`.
    ///
    /// # Errors
    /// `ParleyError::Connection` if the session cannot even be attempted.
    fn open(
        &self,
        config: &SessionConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn TransportHandle>>;
}

/// Result of offering a frame to the outbound link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// No open session; the frame was dropped.
    NotOpen,
}

/// The capture thread's only path to the transport.
///
/// The controller attaches the handle when the session opens and detaches it
/// before anything else on teardown. Both happen under the same lock that a
/// send holds, so no frame can reach a handle after it was detached.
#[derive(Default)]
pub struct OutboundLink {
    slot: Mutex<Option<Arc<dyn TransportHandle>>>,
}

impl OutboundLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, handle: Arc<dyn TransportHandle>) {
        *self.slot.lock() = Some(handle);
    }

    pub fn detach(&self) -> Option<Arc<dyn TransportHandle>> {
        self.slot.lock().take()
    }

    pub fn is_attached(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Send `frame` if a session is open, otherwise drop it.
    pub fn send(&self, frame: &AudioFrame) -> Result<SendOutcome> {
        let slot = self.slot.lock();
        match slot.as_ref() {
            Some(handle) => handle.send(frame).map(|()| SendOutcome::Sent),
            None => Ok(SendOutcome::NotOpen),
        }
    }
}

impl std::fmt::Debug for OutboundLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundLink")
            .field("attached", &self.is_attached())
            .finish()
    }
}
