//! Media engine contract
//!
//! Capture, rendering and the peer connection itself live outside this crate.
//! The orchestrator and the negotiation guard only talk to them through
//! [`MediaEngine`] and [`PeerConnection`]; streams are opaque handles.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::CallResult;
use crate::session::CallKind;

/// Opaque handle to a local or remote audio stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: String,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP blob and whether it is an offer or an answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    pub fn with_mid(mut self, sdp_mid: impl Into<String>, m_line_index: u16) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self.sdp_m_line_index = Some(m_line_index);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks from a peer connection, delivered over the channel handed to
/// [`MediaEngine::create_peer_connection`]
#[derive(Debug, Clone, PartialEq)]
pub enum PeerConnectionEvent {
    LocalIceCandidate(IceCandidate),
    RemoteStream(MediaStream),
    ConnectionStateChanged(PeerConnectionState),
    IceConnectionStateChanged(IceConnectionState),
}

/// Local media capture plus peer connection factory
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// One-time engine bootstrap
    async fn initialize(&self) -> CallResult<()>;

    /// Acquire the microphone. Failures must be reported as
    /// `CallError::MediaAcquisitionFailed` with the matching `MediaFailureKind`.
    async fn acquire_local_stream(&self, kind: CallKind) -> CallResult<MediaStream>;

    async fn release_local_stream(&self, stream: &MediaStream);

    /// Create a fresh peer connection. Its callbacks go to `events`.
    async fn create_peer_connection(
        &self,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> CallResult<Arc<dyn PeerConnection>>;
}

/// A single peer-to-peer media connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_stream(&self, stream: &MediaStream) -> CallResult<()>;

    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> CallResult<SessionDescription>;

    /// Create an answer to `remote_offer` (already applied as the remote
    /// description) and apply it as the local description
    async fn create_answer(&self, remote_offer: &SessionDescription) -> CallResult<SessionDescription>;

    async fn set_remote_description(&self, description: &SessionDescription) -> CallResult<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> CallResult<()>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_candidate_wire_shape() {
        let candidate = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.2 54400 typ host")
            .with_mid("0", 0);
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);

        let bare: IceCandidate = serde_json::from_str(r#"{"candidate":"c"}"#).unwrap();
        assert_eq!(bare, IceCandidate::new("c"));
    }
}
