use thiserror::Error;

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("frame send failed: {0}")]
    SendFailed(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("session was stopped before start completed")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Whether this error ends the session it occurred in.
    ///
    /// A malformed inbound chunk is dropped on its own; everything else funnels
    /// into a full teardown.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ParleyError::MalformedPayload(_))
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
