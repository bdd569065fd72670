//! Phases, event kinds and the typed event payloads that drive the phase machine

use serde::{Deserialize, Serialize};

use crate::error::{CallError, MediaFailureKind};
use crate::session::{CallKind, RemoteParty, SessionId};

/// Lifecycle phase of the call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Initiating,
    Calling,
    Ringing,
    Connecting,
    Connected,
    Disconnecting,
    Ended,
    Failed,
    Rejected,
}

impl Phase {
    pub const ALL: [Phase; 10] = [
        Phase::Idle,
        Phase::Initiating,
        Phase::Calling,
        Phase::Ringing,
        Phase::Connecting,
        Phase::Connected,
        Phase::Disconnecting,
        Phase::Ended,
        Phase::Failed,
        Phase::Rejected,
    ];

    /// Terminal phases only accept `Reset` and auto-recover after a grace delay
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Ended | Phase::Failed | Phase::Rejected)
    }

    /// A session exists in every phase but `Idle`
    pub fn has_session(&self) -> bool {
        !matches!(self, Phase::Idle)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Event discriminant used for table lookup, priority and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    StartCall,
    AcceptCall,
    RejectCall,
    EndCall,
    CallRequestReceived,
    CallAccepted,
    CallRejected,
    CallCancelled,
    CallEnded,
    MediaAcquired,
    NegotiationStarted,
    NegotiationEstablished,
    NegotiationFailed,
    NegotiationLost,
    MediaFailed,
    ConnectionFailed,
    Timeout,
    Reset,
}

impl EventKind {
    pub const ALL: [EventKind; 18] = [
        EventKind::StartCall,
        EventKind::AcceptCall,
        EventKind::RejectCall,
        EventKind::EndCall,
        EventKind::CallRequestReceived,
        EventKind::CallAccepted,
        EventKind::CallRejected,
        EventKind::CallCancelled,
        EventKind::CallEnded,
        EventKind::MediaAcquired,
        EventKind::NegotiationStarted,
        EventKind::NegotiationEstablished,
        EventKind::NegotiationFailed,
        EventKind::NegotiationLost,
        EventKind::MediaFailed,
        EventKind::ConnectionFailed,
        EventKind::Timeout,
        EventKind::Reset,
    ];

    /// Mailbox priority, higher is processed first.
    ///
    /// Hang-ups and failures always outrank anything that moves a call forward,
    /// so a concurrent hang-up cancels an in-flight connect instead of racing it.
    pub fn priority(&self) -> u8 {
        match self {
            EventKind::Reset => 100,
            EventKind::EndCall => 90,
            EventKind::CallEnded => 80,
            EventKind::MediaFailed
            | EventKind::NegotiationFailed
            | EventKind::ConnectionFailed
            | EventKind::NegotiationLost => 70,
            EventKind::Timeout => 60,
            EventKind::RejectCall | EventKind::CallRejected | EventKind::CallCancelled => 50,
            EventKind::NegotiationEstablished => 40,
            EventKind::AcceptCall | EventKind::CallAccepted => 30,
            EventKind::NegotiationStarted => 20,
            EventKind::MediaAcquired => 15,
            EventKind::CallRequestReceived => 10,
            EventKind::StartCall => 5,
        }
    }
}

/// Which timeout budget expired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutKind {
    Initialization,
    /// Ringing / waiting for the remote party to answer
    CallSetup,
    /// SDP/ICE exchange after acceptance
    Negotiation,
    Teardown,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimeoutKind::Initialization => "initialization",
            TimeoutKind::CallSetup => "call_setup",
            TimeoutKind::Negotiation => "negotiation",
            TimeoutKind::Teardown => "teardown",
        };
        f.write_str(s)
    }
}

/// Why a `Reset` was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResetReason {
    /// Requested by the embedding application
    Explicit,
    /// Emitted by the machine after the terminal grace delay
    AutoRecovery,
    /// Dismissal of a terminal phase through `end_call`
    Dismissed,
}

/// A typed event for the phase machine
///
/// `session_id` fields reference the session the event belongs to. Events from
/// the local user that always target "the current call" (`EndCall`) carry none.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PhaseEvent {
    StartCall { session_id: SessionId, remote: RemoteParty, call_kind: CallKind },
    AcceptCall { session_id: SessionId },
    RejectCall { session_id: SessionId, reason: Option<String> },
    EndCall,
    CallRequestReceived { session_id: SessionId, remote: RemoteParty, call_kind: CallKind },
    /// `session_id` is the authoritative id assigned by the transport
    CallAccepted { session_id: SessionId },
    CallRejected { session_id: Option<SessionId>, reason: Option<String> },
    CallCancelled { session_id: Option<SessionId>, reason: Option<String> },
    CallEnded { session_id: Option<SessionId>, reason: Option<String> },
    MediaAcquired { session_id: SessionId },
    NegotiationStarted { session_id: Option<SessionId> },
    NegotiationEstablished { session_id: Option<SessionId> },
    NegotiationFailed { session_id: Option<SessionId>, reason: String },
    NegotiationLost { session_id: Option<SessionId> },
    MediaFailed { session_id: Option<SessionId>, kind: MediaFailureKind, reason: String },
    ConnectionFailed { session_id: Option<SessionId>, reason: String },
    Timeout { session_id: Option<SessionId>, operation: TimeoutKind, after_ms: u64 },
    Reset { reason: ResetReason },
}

impl PhaseEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PhaseEvent::StartCall { .. } => EventKind::StartCall,
            PhaseEvent::AcceptCall { .. } => EventKind::AcceptCall,
            PhaseEvent::RejectCall { .. } => EventKind::RejectCall,
            PhaseEvent::EndCall => EventKind::EndCall,
            PhaseEvent::CallRequestReceived { .. } => EventKind::CallRequestReceived,
            PhaseEvent::CallAccepted { .. } => EventKind::CallAccepted,
            PhaseEvent::CallRejected { .. } => EventKind::CallRejected,
            PhaseEvent::CallCancelled { .. } => EventKind::CallCancelled,
            PhaseEvent::CallEnded { .. } => EventKind::CallEnded,
            PhaseEvent::MediaAcquired { .. } => EventKind::MediaAcquired,
            PhaseEvent::NegotiationStarted { .. } => EventKind::NegotiationStarted,
            PhaseEvent::NegotiationEstablished { .. } => EventKind::NegotiationEstablished,
            PhaseEvent::NegotiationFailed { .. } => EventKind::NegotiationFailed,
            PhaseEvent::NegotiationLost { .. } => EventKind::NegotiationLost,
            PhaseEvent::MediaFailed { .. } => EventKind::MediaFailed,
            PhaseEvent::ConnectionFailed { .. } => EventKind::ConnectionFailed,
            PhaseEvent::Timeout { .. } => EventKind::Timeout,
            PhaseEvent::Reset { .. } => EventKind::Reset,
        }
    }

    pub fn priority(&self) -> u8 {
        self.kind().priority()
    }

    /// The session this event refers to, if any
    pub fn session_ref(&self) -> Option<&SessionId> {
        match self {
            PhaseEvent::StartCall { session_id, .. }
            | PhaseEvent::AcceptCall { session_id }
            | PhaseEvent::RejectCall { session_id, .. }
            | PhaseEvent::CallRequestReceived { session_id, .. }
            | PhaseEvent::CallAccepted { session_id }
            | PhaseEvent::MediaAcquired { session_id } => Some(session_id),

            PhaseEvent::CallRejected { session_id, .. }
            | PhaseEvent::CallCancelled { session_id, .. }
            | PhaseEvent::CallEnded { session_id, .. }
            | PhaseEvent::NegotiationStarted { session_id }
            | PhaseEvent::NegotiationEstablished { session_id }
            | PhaseEvent::NegotiationFailed { session_id, .. }
            | PhaseEvent::NegotiationLost { session_id }
            | PhaseEvent::MediaFailed { session_id, .. }
            | PhaseEvent::ConnectionFailed { session_id, .. }
            | PhaseEvent::Timeout { session_id, .. } => session_id.as_ref(),

            PhaseEvent::EndCall | PhaseEvent::Reset { .. } => None,
        }
    }

    /// Events that introduce a new session id rather than referencing the live one
    pub fn creates_session(&self) -> bool {
        matches!(self, PhaseEvent::StartCall { .. } | PhaseEvent::CallRequestReceived { .. })
    }

    /// Human readable reason carried by the event
    pub fn reason(&self) -> Option<String> {
        match self {
            PhaseEvent::RejectCall { reason, .. }
            | PhaseEvent::CallRejected { reason, .. }
            | PhaseEvent::CallCancelled { reason, .. }
            | PhaseEvent::CallEnded { reason, .. } => reason.clone(),
            PhaseEvent::NegotiationFailed { reason, .. }
            | PhaseEvent::MediaFailed { reason, .. }
            | PhaseEvent::ConnectionFailed { reason, .. } => Some(reason.clone()),
            PhaseEvent::Timeout { operation, .. } => Some(format!("{} timeout", operation)),
            PhaseEvent::NegotiationLost { .. } => Some("media connection lost".to_string()),
            _ => None,
        }
    }

    /// The user-visible error this event represents when it fails a call
    pub fn failure(&self) -> Option<CallError> {
        match self {
            PhaseEvent::MediaFailed { kind, reason, .. } => {
                Some(CallError::media_acquisition_failed(*kind, reason.clone()))
            }
            PhaseEvent::NegotiationFailed { reason, .. } => Some(CallError::negotiation_failed(reason.clone())),
            PhaseEvent::ConnectionFailed { reason, .. } => Some(CallError::signaling_failed(reason.clone())),
            PhaseEvent::Timeout { operation, after_ms, .. } => Some(CallError::Timeout {
                operation: operation.to_string(),
                duration_ms: *after_ms,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let ordered = [
            EventKind::Reset,
            EventKind::EndCall,
            EventKind::CallEnded,
            EventKind::NegotiationFailed,
            EventKind::Timeout,
            EventKind::CallRejected,
            EventKind::NegotiationEstablished,
            EventKind::CallAccepted,
            EventKind::NegotiationStarted,
            EventKind::MediaAcquired,
            EventKind::CallRequestReceived,
            EventKind::StartCall,
        ];
        for pair in ordered.windows(2) {
            assert!(
                pair[0].priority() > pair[1].priority(),
                "{:?} should outrank {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_end_call_never_references_a_session() {
        assert_eq!(PhaseEvent::EndCall.session_ref(), None);
        let accepted = PhaseEvent::CallAccepted { session_id: SessionId::from("srv-1") };
        assert_eq!(accepted.session_ref(), Some(&SessionId::from("srv-1")));
    }

    #[test]
    fn test_failure_mapping() {
        let timeout = PhaseEvent::Timeout {
            session_id: None,
            operation: TimeoutKind::Negotiation,
            after_ms: 15_000,
        };
        assert_eq!(
            timeout.failure(),
            Some(CallError::Timeout { operation: "negotiation".into(), duration_ms: 15_000 })
        );
        assert_eq!(PhaseEvent::EndCall.failure(), None);
    }
}
