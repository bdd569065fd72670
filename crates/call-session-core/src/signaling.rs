//! Signaling channel contract and wire messages
//!
//! Messages are JSON objects keyed by an `event` name with camelCase fields:
//!
//! ```json
//! {"event":"initiate-call","remoteId":"T1","callKind":"voice","timestamp":"...","sessionId":"tmp-..."}
//! ```
//!
//! The channel is untrusted and asynchronous: notifications may arrive late,
//! twice or out of order. The orchestrator validates every one of them against
//! the current phase and session before acting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::CallResult;
use crate::media::IceCandidate;
use crate::session::{CallKind, SessionId};

/// Outbound messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SignalingMessage {
    #[serde(rename_all = "camelCase")]
    InitiateCall {
        remote_id: String,
        call_kind: CallKind,
        timestamp: DateTime<Utc>,
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    AcceptCall { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    RejectCall { session_id: SessionId, reason: String },
    /// Sent while the session still runs on a temporary id
    #[serde(rename_all = "camelCase")]
    CancelCall {
        remote_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    EndCall { session_id: SessionId, duration_seconds: u64 },
    #[serde(rename_all = "camelCase")]
    Offer { session_id: SessionId, sdp: String },
    #[serde(rename_all = "camelCase")]
    Answer { session_id: SessionId, sdp: String },
    #[serde(rename_all = "camelCase")]
    IceCandidate { session_id: SessionId, candidate: IceCandidate },
}

impl SignalingMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalingMessage::InitiateCall { .. } => "initiate-call",
            SignalingMessage::AcceptCall { .. } => "accept-call",
            SignalingMessage::RejectCall { .. } => "reject-call",
            SignalingMessage::CancelCall { .. } => "cancel-call",
            SignalingMessage::EndCall { .. } => "end-call",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// Inbound notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SignalingNotification {
    #[serde(rename_all = "camelCase")]
    CallRequest {
        session_id: SessionId,
        from_id: String,
        from_name: String,
        call_kind: CallKind,
    },
    #[serde(rename_all = "camelCase")]
    CallAccepted { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    CallRejected {
        session_id: SessionId,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CallCancelled {
        #[serde(default)]
        session_id: Option<SessionId>,
        #[serde(default)]
        from_id: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CallEnded {
        session_id: SessionId,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        ended_by: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Offer { session_id: SessionId, sdp: String },
    #[serde(rename_all = "camelCase")]
    Answer { session_id: SessionId, sdp: String },
    #[serde(rename_all = "camelCase")]
    IceCandidate { session_id: SessionId, candidate: IceCandidate },
    /// The transport lost its connection
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl SignalingNotification {
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalingNotification::CallRequest { .. } => "call-request",
            SignalingNotification::CallAccepted { .. } => "call-accepted",
            SignalingNotification::CallRejected { .. } => "call-rejected",
            SignalingNotification::CallCancelled { .. } => "call-cancelled",
            SignalingNotification::CallEnded { .. } => "call-ended",
            SignalingNotification::Offer { .. } => "offer",
            SignalingNotification::Answer { .. } => "answer",
            SignalingNotification::IceCandidate { .. } => "ice-candidate",
            SignalingNotification::Disconnected { .. } => "disconnected",
        }
    }
}

/// Publish/subscribe transport between the two parties
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn connect(&self) -> CallResult<()>;

    async fn send(&self, message: SignalingMessage) -> CallResult<()>;

    /// Stream of inbound notifications for the local identity
    fn subscribe(&self) -> broadcast::Receiver<SignalingNotification>;

    async fn disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_wire_shape() {
        let message = SignalingMessage::EndCall {
            session_id: SessionId::from("srv-1"),
            duration_seconds: 42,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["event"], "end-call");
        assert_eq!(json["sessionId"], "srv-1");
        assert_eq!(json["durationSeconds"], 42);
        assert_eq!(message.event_name(), "end-call");

        let initiate = SignalingMessage::InitiateCall {
            remote_id: "T1".into(),
            call_kind: CallKind::Voice,
            timestamp: Utc::now(),
            session_id: SessionId::from("tmp-1"),
        };
        let json = serde_json::to_value(&initiate).unwrap();
        assert_eq!(json["event"], "initiate-call");
        assert_eq!(json["remoteId"], "T1");
        assert_eq!(json["callKind"], "voice");
    }

    #[test]
    fn test_inbound_parsing() {
        let raw = r#"{"event":"call-request","sessionId":"srv-7","fromId":"P1","fromName":"Pat","callKind":"voice"}"#;
        let parsed: SignalingNotification = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed,
            SignalingNotification::CallRequest {
                session_id: SessionId::from("srv-7"),
                from_id: "P1".into(),
                from_name: "Pat".into(),
                call_kind: CallKind::Voice,
            }
        );

        let cancelled: SignalingNotification =
            serde_json::from_str(r#"{"event":"call-cancelled","fromId":"P1"}"#).unwrap();
        assert_eq!(cancelled.event_name(), "call-cancelled");
    }
}
