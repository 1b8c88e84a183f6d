//! # parley-core
//!
//! Duplex audio engine for real-time speech sessions.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → cpal callback → SPSC RingBuffer → capture pipeline (spawn_blocking)
//!                                                    │ resample → frames → PCM16
//!                                                    ▼
//!                                              OutboundLink ──► SessionTransport
//!                                                                    │
//!                             TransportEvent (opened / chunk / interrupted / closed)
//!                                                                    ▼
//!                                      SessionController event task ─► PlaybackScheduler
//!                                                                    │
//!                                                 cpal output (Mixer on the device clock)
//! ```
//!
//! The audio callbacks never block or allocate on the steady path. All heap
//! work happens on the capture thread and the session event task.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod codec;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod transport;

// Convenience re-exports for downstream crates
pub use audio::{
    device::{list_input_devices, list_output_devices, DeviceDirection, DeviceInfo},
    output::CpalOutputDevice,
    CpalMicrophone, InputStream, Microphone,
};
pub use engine::{pipeline::DiagnosticsSnapshot, EngineConfig, SessionController};
pub use error::{ParleyError, Result};
pub use ipc::events::{
    PayloadDiagnosticEvent, PlaybackActivityEvent, SessionState, SessionStateEvent,
};
pub use playback::{
    OutputClock, OutputDevice, PlaybackDiagnosticsSnapshot, PlaybackScheduler, PlaybackSink,
};
pub use transport::{
    EchoTransport, SessionConfig, SessionTransport, TransportEvent, TransportEventSender,
    TransportHandle, NORMAL_CLOSE_CODE,
};
