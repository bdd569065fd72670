//! Call session data
//!
//! A [`CallSession`] is the single unit of lifecycle state. It is created by the
//! phase machine when a call starts (caller) or rings (callee), updated as events
//! are applied and dropped when the machine returns to `Idle`. Nothing outside
//! the machine mutates it; everyone else sees snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::Phase;

/// Identifier of a call session as seen on the signaling channel
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// A locally generated placeholder, used until the transport assigns the real id
    pub fn temporary() -> Self {
        Self(format!("tmp-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Whether a session id came from us or from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdProvenance {
    /// Placeholder generated locally; the remote side has never seen it
    Temporary,
    /// Assigned by the signaling channel and known to both parties
    Authoritative,
}

/// Kind of call. Audio only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    #[default]
    Voice,
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallKind::Voice => f.write_str("voice"),
        }
    }
}

impl std::str::FromStr for CallKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "voice" | "audio" => Ok(CallKind::Voice),
            other => Err(format!("unsupported call kind: {}", other)),
        }
    }
}

/// Which side of the call this party is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallRole {
    /// Placed the call and owns the SDP offer
    Caller,
    /// Received the call and answers the offer
    Callee,
}

/// The other party of a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteParty {
    pub id: String,
    pub display_name: String,
}

impl RemoteParty {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// The local identity driving an orchestrator
///
/// Whether an identity may place or receive calls is a domain rule (for example
/// only clinicians may dial patients); the orchestrator enforces it, the phase
/// machine does not know about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalParty {
    pub id: String,
    pub display_name: String,
    pub can_place_calls: bool,
    pub can_receive_calls: bool,
}

impl LocalParty {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            can_place_calls: true,
            can_receive_calls: true,
        }
    }

    pub fn receive_only(mut self) -> Self {
        self.can_place_calls = false;
        self
    }

    pub fn place_only(mut self) -> Self {
        self.can_receive_calls = false;
        self
    }
}

/// Lifecycle state of the (single) active call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub session_id: SessionId,
    pub id_provenance: IdProvenance,
    pub role: CallRole,
    pub remote_party_id: String,
    pub remote_party_display_name: String,
    pub call_kind: CallKind,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub current_phase: Phase,
    pub previous_phase: Phase,
}

impl CallSession {
    pub(crate) fn outgoing(session_id: SessionId, remote: &RemoteParty, call_kind: CallKind) -> Self {
        Self::new(session_id, IdProvenance::Temporary, CallRole::Caller, remote, call_kind)
    }

    pub(crate) fn incoming(session_id: SessionId, remote: &RemoteParty, call_kind: CallKind) -> Self {
        Self::new(session_id, IdProvenance::Authoritative, CallRole::Callee, remote, call_kind)
    }

    fn new(
        session_id: SessionId,
        id_provenance: IdProvenance,
        role: CallRole,
        remote: &RemoteParty,
        call_kind: CallKind,
    ) -> Self {
        Self {
            session_id,
            id_provenance,
            role,
            remote_party_id: remote.id.clone(),
            remote_party_display_name: remote.display_name.clone(),
            call_kind,
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            current_phase: Phase::Idle,
            previous_phase: Phase::Idle,
        }
    }

    /// True while the session still runs on a locally generated placeholder id
    pub fn is_temporary(&self) -> bool {
        self.id_provenance == IdProvenance::Temporary
    }

    /// Adopt the transport-assigned id, returning the placeholder if it changed
    ///
    /// A transport that echoes the placeholder back still makes it
    /// authoritative; only a different id retires the old one.
    pub(crate) fn adopt_authoritative_id(&mut self, id: SessionId) -> Option<SessionId> {
        if !self.is_temporary() {
            return None;
        }
        self.id_provenance = IdProvenance::Authoritative;
        if id == self.session_id {
            return None;
        }
        Some(std::mem::replace(&mut self.session_id, id))
    }

    /// Seconds since the media path was established (0 if it never was)
    pub fn connected_duration_secs(&self, now: DateTime<Utc>) -> u64 {
        self.connected_at
            .map(|at| (now - at).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }
}
