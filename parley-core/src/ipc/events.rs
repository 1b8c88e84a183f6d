//! Events broadcast by the session controller.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `SessionStateEvent` | `SessionController::subscribe_state` |
//! | `PlaybackActivityEvent` | `SessionController::subscribe_activity` |
//! | `PayloadDiagnosticEvent` | `SessionController::subscribe_diagnostics` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Lifecycle state of the session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session; `start()` may be called.
    Idle,
    /// Microphone, output and transport are being acquired.
    Connecting,
    /// Transport open; frames flow out and chunks flow in.
    Streaming,
    /// Teardown in progress.
    Closing,
    /// A session ended on an error. Always followed by `Closing` then `Idle`.
    Error,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Streaming)
    }
}

/// Emitted whenever the controller changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateEvent {
    pub state: SessionState,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Playback activity
// ---------------------------------------------------------------------------

/// Emitted when model playback starts or stops producing sound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackActivityEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub producing: bool,
    /// Chunks scheduled or playing at the time of the transition.
    pub active_chunks: usize,
}

// ---------------------------------------------------------------------------
// Payload diagnostics
// ---------------------------------------------------------------------------

/// Emitted when an inbound chunk is dropped without ending the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadDiagnosticEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub reason: String,
    /// Size of the offending payload in bytes.
    pub bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_event_serializes_with_lowercase_state() {
        let event = SessionStateEvent {
            state: SessionState::Streaming,
            detail: None,
        };

        let json = serde_json::to_value(&event).expect("serialize state event");
        assert_eq!(json["state"], "streaming");
        assert!(json["detail"].is_null());

        let round_trip: SessionStateEvent =
            serde_json::from_value(json).expect("deserialize state event");
        assert_eq!(round_trip.state, SessionState::Streaming);
    }

    #[test]
    fn error_state_carries_detail() {
        let event = SessionStateEvent {
            state: SessionState::Error,
            detail: Some("connection error: reset".into()),
        };
        let json = serde_json::to_value(&event).expect("serialize state event");
        assert_eq!(json["state"], "error");
        assert_eq!(json["detail"], "connection error: reset");
    }

    #[test]
    fn session_state_rejects_non_lowercase_values() {
        let err = serde_json::from_str::<SessionState>(r#""Idle""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }

    #[test]
    fn activity_event_serializes_with_camel_case_fields() {
        let event = PlaybackActivityEvent {
            seq: 4,
            producing: true,
            active_chunks: 2,
        };

        let json = serde_json::to_value(&event).expect("serialize activity event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["producing"], true);
        assert_eq!(json["activeChunks"], 2);
    }

    #[test]
    fn active_states() {
        assert!(SessionState::Connecting.is_active());
        assert!(SessionState::Streaming.is_active());
        assert!(!SessionState::Idle.is_active());
        assert!(!SessionState::Closing.is_active());
        assert!(!SessionState::Error.is_active());
    }
}
