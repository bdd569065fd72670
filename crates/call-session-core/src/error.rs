//! Error types and handling for call-session-core
//!
//! Every fallible operation in this crate returns [`CallResult`]. Errors fall into
//! two groups that are handled very differently:
//!
//! - **Locally recovered** - [`CallError::InvalidTransition`] and
//!   [`CallError::StaleReference`]. The offending event is rejected and logged and
//!   the phase machine stays where it is. Callers normally just log these.
//! - **User visible** - media, negotiation, signaling and timeout failures. These
//!   move the session to `Failed` and are broadcast as
//!   [`CallEvent::CallFailed`](crate::events::CallEvent::CallFailed) with a stable
//!   [`reason_code`](CallError::reason_code).
//!
//! ```rust
//! # use rvoip_call_session_core::{CallError, Phase, EventKind};
//! let err = CallError::InvalidTransition { phase: Phase::Idle, event: EventKind::EndCall };
//! assert_eq!(err.category(), "state");
//! assert!(!err.is_recoverable());
//! ```

use thiserror::Error;

use crate::phase::{EventKind, Phase};
use crate::session::SessionId;

/// Result type alias for call-session-core operations
pub type CallResult<T> = Result<T, CallError>;

/// Why local media could not be acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MediaFailureKind {
    /// The user or platform refused microphone access
    PermissionDenied,
    /// The capture device is held by another application
    DeviceBusy,
    /// No capture device is present
    DeviceNotFound,
    /// Anything the engine could not classify
    Other,
}

impl std::fmt::Display for MediaFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MediaFailureKind::PermissionDenied => "permission denied",
            MediaFailureKind::DeviceBusy => "device busy",
            MediaFailureKind::DeviceNotFound => "device not found",
            MediaFailureKind::Other => "unknown media failure",
        };
        f.write_str(s)
    }
}

/// Error types for call session operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// Bootstrap (signaling connect + media engine init) failed after retries
    #[error("Initialization failed: {reason}")]
    InitializationFailed { reason: String },

    #[error("Orchestrator not initialized")]
    NotInitialized,

    #[error("Media acquisition failed ({kind}): {reason}")]
    MediaAcquisitionFailed { kind: MediaFailureKind, reason: String },

    /// Transport send/connect errors
    #[error("Signaling failed: {reason}")]
    SignalingFailed { reason: String },

    /// SDP or ICE errors
    #[error("Negotiation failed: {reason}")]
    NegotiationFailed { reason: String },

    #[error("Operation {operation} timed out after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Event not legal for the current phase
    #[error("Invalid transition: {event:?} is not accepted in phase {phase:?}")]
    InvalidTransition { phase: Phase, event: EventKind },

    /// Session id mismatch (stale or duplicate notification)
    #[error("Stale session reference {received} (active: {active:?})")]
    StaleReference { active: Option<SessionId>, received: SessionId },

    #[error("Permission denied: {operation}")]
    PermissionDenied { operation: String },

    /// The mailbox dropped the event before it was applied
    #[error("Event {event:?} discarded: {reason}")]
    EventDiscarded { event: EventKind, reason: String },

    #[error("Circuit open for {operation}, retry in {retry_after_ms}ms")]
    CircuitOpen { operation: String, retry_after_ms: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CallError {
    pub fn initialization_failed(reason: impl Into<String>) -> Self {
        Self::InitializationFailed { reason: reason.into() }
    }

    pub fn media_acquisition_failed(kind: MediaFailureKind, reason: impl Into<String>) -> Self {
        Self::MediaAcquisitionFailed { kind, reason: reason.into() }
    }

    pub fn signaling_failed(reason: impl Into<String>) -> Self {
        Self::SignalingFailed { reason: reason.into() }
    }

    pub fn negotiation_failed(reason: impl Into<String>) -> Self {
        Self::NegotiationFailed { reason: reason.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if this error is worth retrying (drives the bootstrap retry policy)
    pub fn is_recoverable(&self) -> bool {
        match self {
            CallError::SignalingFailed { .. }
            | CallError::Timeout { .. }
            | CallError::Internal { .. } => true,

            CallError::MediaAcquisitionFailed { kind, .. } => {
                matches!(kind, MediaFailureKind::DeviceBusy)
            }

            CallError::InitializationFailed { .. }
            | CallError::NotInitialized
            | CallError::NegotiationFailed { .. }
            | CallError::InvalidTransition { .. }
            | CallError::StaleReference { .. }
            | CallError::PermissionDenied { .. }
            | CallError::EventDiscarded { .. }
            | CallError::CircuitOpen { .. } => false,
        }
    }

    /// Errors that are rejected in place without disturbing the session
    pub fn is_locally_recovered(&self) -> bool {
        matches!(
            self,
            CallError::InvalidTransition { .. }
                | CallError::StaleReference { .. }
                | CallError::EventDiscarded { .. }
        )
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            CallError::InitializationFailed { .. }
            | CallError::NotInitialized
            | CallError::CircuitOpen { .. } => "bootstrap",

            CallError::MediaAcquisitionFailed { .. } => "media",

            CallError::SignalingFailed { .. } => "network",

            CallError::NegotiationFailed { .. } => "negotiation",

            CallError::InvalidTransition { .. }
            | CallError::StaleReference { .. }
            | CallError::EventDiscarded { .. } => "state",

            CallError::PermissionDenied { .. } => "identity",

            CallError::Timeout { .. } | CallError::Internal { .. } => "system",
        }
    }

    /// Stable reason code shown to users when a call fails
    pub fn reason_code(&self) -> &'static str {
        match self {
            CallError::InitializationFailed { .. } => "initialization-failed",
            CallError::NotInitialized => "not-initialized",
            CallError::MediaAcquisitionFailed { kind, .. } => match kind {
                MediaFailureKind::PermissionDenied => "media-permission-denied",
                MediaFailureKind::DeviceBusy => "media-device-busy",
                MediaFailureKind::DeviceNotFound => "media-device-not-found",
                MediaFailureKind::Other => "media-unavailable",
            },
            CallError::SignalingFailed { .. } => "signaling-failed",
            CallError::NegotiationFailed { .. } => "negotiation-failed",
            CallError::Timeout { .. } => "timeout",
            CallError::InvalidTransition { .. } => "invalid-transition",
            CallError::StaleReference { .. } => "stale-reference",
            CallError::PermissionDenied { .. } => "permission-denied",
            CallError::EventDiscarded { .. } => "event-discarded",
            CallError::CircuitOpen { .. } => "circuit-open",
            CallError::Internal { .. } => "internal-error",
        }
    }
}
