//! Events broadcast to the embedding application
//!
//! Subscribe with [`CallOrchestrator::subscribe_events`](crate::CallOrchestrator::subscribe_events).
//! Delivery is a `tokio::sync::broadcast` channel, so slow subscribers may lag
//! and miss events; the authoritative state is always `phase()` / `session()`.

use crate::error::CallError;
use crate::media::MediaStream;
use crate::phase::{Phase, PhaseTransition};
use crate::session::{CallKind, RemoteParty, SessionId};

/// Event priority levels for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Every applied phase transition
    PhaseChanged(PhaseTransition),
    /// A call request is ringing locally
    IncomingCall {
        session_id: SessionId,
        remote: RemoteParty,
        call_kind: CallKind,
    },
    /// The remote party's audio arrived
    RemoteStream {
        session_id: Option<SessionId>,
        stream: MediaStream,
    },
    /// The call moved to `Failed`
    CallFailed {
        session_id: Option<SessionId>,
        error: CallError,
    },
}

impl CallEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            CallEvent::PhaseChanged(transition) if transition.phase == Phase::Failed => EventPriority::High,
            CallEvent::PhaseChanged(_) => EventPriority::Normal,
            CallEvent::IncomingCall { .. } => EventPriority::High,
            CallEvent::RemoteStream { .. } => EventPriority::Low,
            CallEvent::CallFailed { .. } => EventPriority::Critical,
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            CallEvent::PhaseChanged(transition) => transition.session_id(),
            CallEvent::IncomingCall { session_id, .. } => Some(session_id),
            CallEvent::RemoteStream { session_id, .. } | CallEvent::CallFailed { session_id, .. } => {
                session_id.as_ref()
            }
        }
    }

    /// Stable reason code for failure events
    pub fn reason_code(&self) -> Option<&'static str> {
        match self {
            CallEvent::CallFailed { error, .. } => Some(error.reason_code()),
            _ => None,
        }
    }
}
