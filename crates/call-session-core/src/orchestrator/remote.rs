//! Remote notification handlers
//!
//! Each handler validates role and phase before touching the machine. A
//! notification that does not apply to the current call is logged and dropped,
//! never surfaced as an error.

use tracing::{debug, info, warn};

use super::CallOrchestrator;
use crate::error::{CallError, CallResult};
use crate::media::{IceCandidate, SessionDescription};
use crate::negotiation::{RemoteAnswerOutcome, RemoteOfferOutcome};
use crate::phase::{Phase, PhaseEvent};
use crate::session::{CallKind, CallRole, RemoteParty, SessionId};
use crate::signaling::{SignalingMessage, SignalingNotification};

impl CallOrchestrator {
    /// Route one inbound notification to its handler
    pub async fn dispatch(&self, notification: SignalingNotification) {
        let name = notification.event_name();
        debug!(notification = name, phase = ?self.machine.phase(), "Signaling notification received");

        let handled = match notification {
            SignalingNotification::CallRequest {
                session_id,
                from_id,
                from_name,
                call_kind,
            } => {
                self.on_incoming_request(session_id, RemoteParty::new(from_id, from_name), call_kind)
                    .await
            }
            SignalingNotification::CallAccepted { session_id } => self.on_accepted(session_id).await,
            SignalingNotification::CallRejected { session_id, reason } => {
                self.on_rejected(session_id, reason).await
            }
            SignalingNotification::CallCancelled {
                session_id,
                from_id,
                reason,
            } => self.on_cancelled(session_id, from_id, reason).await,
            SignalingNotification::CallEnded {
                session_id,
                reason,
                ended_by,
            } => self.on_ended(session_id, reason, ended_by).await,
            SignalingNotification::Offer { session_id, sdp } => self.on_remote_offer(session_id, sdp).await,
            SignalingNotification::Answer { session_id, sdp } => {
                self.on_remote_answer(session_id, sdp).await
            }
            SignalingNotification::IceCandidate {
                session_id,
                candidate,
            } => self.on_remote_candidate(session_id, candidate).await,
            SignalingNotification::Disconnected { reason } => {
                self.on_transport_disconnected(reason).await
            }
        };

        if let Err(e) = handled {
            if e.is_locally_recovered() {
                debug!(notification = name, error = %e, "Notification did not apply");
            } else {
                warn!(notification = name, error = %e, category = e.category(), "Notification handling failed");
            }
        }
    }

    pub async fn on_incoming_request(
        &self,
        session_id: SessionId,
        remote: RemoteParty,
        call_kind: CallKind,
    ) -> CallResult<()> {
        if !self.local.can_receive_calls {
            warn!(session_id = %session_id, from = %remote.id, "Local identity cannot receive calls");
            self.send_best_effort(SignalingMessage::RejectCall {
                session_id,
                reason: "unavailable".to_string(),
            })
            .await;
            return Ok(());
        }

        let phase = self.machine.phase();
        if phase != Phase::Idle {
            if self.machine.session_id().as_ref() == Some(&session_id) {
                debug!(session_id = %session_id, "Repeated call request for the current call");
                return Ok(());
            }
            info!(session_id = %session_id, from = %remote.id, phase = ?phase, "Busy, rejecting call request");
            self.send_best_effort(SignalingMessage::RejectCall {
                session_id,
                reason: "busy".to_string(),
            })
            .await;
            return Ok(());
        }

        info!(session_id = %session_id, from = %remote.id, "Incoming call");
        self.machine
            .handle_event(PhaseEvent::CallRequestReceived {
                session_id,
                remote,
                call_kind,
            })
            .await
            .map(|_| ())
    }

    pub async fn on_accepted(&self, session_id: SessionId) -> CallResult<()> {
        if !self.expects(CallRole::Caller, &[Phase::Calling], "call-accepted") {
            return Ok(());
        }
        info!(session_id = %session_id, "Remote party accepted");
        self.machine
            .handle_event(PhaseEvent::CallAccepted { session_id })
            .await
            .map(|_| ())
    }

    pub async fn on_rejected(&self, session_id: SessionId, reason: Option<String>) -> CallResult<()> {
        if !self.expects(CallRole::Caller, &[Phase::Calling, Phase::Connecting], "call-rejected") {
            return Ok(());
        }
        let event = if self.machine.phase() == Phase::Calling {
            PhaseEvent::CallRejected {
                session_id: Some(session_id),
                reason,
            }
        } else {
            // Callee accepted, then could not bring up its media
            PhaseEvent::NegotiationFailed {
                session_id: Some(session_id),
                reason: reason.unwrap_or_else(|| "rejected by remote party".to_string()),
            }
        };
        self.machine.handle_event(event).await.map(|_| ())
    }

    pub async fn on_cancelled(
        &self,
        session_id: Option<SessionId>,
        from_id: Option<String>,
        reason: Option<String>,
    ) -> CallResult<()> {
        if !self.expects(CallRole::Callee, &[Phase::Ringing], "call-cancelled") {
            return Ok(());
        }
        if let (Some(from), Some(session)) = (&from_id, self.machine.session()) {
            if *from != session.remote_party_id {
                debug!(from = %from, expected = %session.remote_party_id, "Cancellation from another party");
                return Ok(());
            }
        }
        self.machine
            .handle_event(PhaseEvent::CallCancelled { session_id, reason })
            .await
            .map(|_| ())
    }

    pub async fn on_ended(
        &self,
        session_id: SessionId,
        reason: Option<String>,
        ended_by: Option<String>,
    ) -> CallResult<()> {
        let phase = self.machine.phase();
        if !matches!(
            phase,
            Phase::Ringing | Phase::Connecting | Phase::Connected | Phase::Disconnecting
        ) {
            debug!(session_id = %session_id, phase = ?phase, "Ignoring call-ended");
            return Ok(());
        }
        info!(session_id = %session_id, ended_by = ?ended_by, "Remote party ended the call");
        self.machine
            .handle_event(PhaseEvent::CallEnded {
                session_id: Some(session_id),
                reason,
            })
            .await
            .map(|_| ())
    }

    pub async fn on_remote_offer(&self, session_id: SessionId, sdp: String) -> CallResult<()> {
        if !self.expects(CallRole::Callee, &[Phase::Connecting, Phase::Connected], "offer") {
            return Ok(());
        }
        let handle = self.registry.get(&session_id).ok_or_else(|| self.unknown(&session_id))?;

        match handle.guard.apply_remote_offer(&SessionDescription::offer(sdp)).await {
            Ok(RemoteOfferOutcome::Answered(answer)) => {
                let message = SignalingMessage::Answer {
                    session_id: session_id.clone(),
                    sdp: answer.sdp,
                };
                if let Err(e) = self.signaling.send(message).await {
                    drop(self.machine.enqueue(PhaseEvent::ConnectionFailed {
                        session_id: Some(session_id),
                        reason: format!("failed to send answer: {}", e),
                    }));
                }
                Ok(())
            }
            Ok(outcome) => {
                debug!(session_id = %session_id, outcome = ?outcome, "Remote offer not applied");
                Ok(())
            }
            Err(e) => {
                drop(self.machine.enqueue(PhaseEvent::NegotiationFailed {
                    session_id: Some(session_id),
                    reason: e.to_string(),
                }));
                Err(e)
            }
        }
    }

    pub async fn on_remote_answer(&self, session_id: SessionId, sdp: String) -> CallResult<()> {
        if !self.expects(CallRole::Caller, &[Phase::Connecting, Phase::Connected], "answer") {
            return Ok(());
        }
        let handle = self.registry.get(&session_id).ok_or_else(|| self.unknown(&session_id))?;

        match handle.guard.apply_remote_answer(&SessionDescription::answer(sdp)).await {
            Ok(RemoteAnswerOutcome::Applied) => Ok(()),
            Ok(RemoteAnswerOutcome::IgnoredUnexpected) => {
                debug!(session_id = %session_id, "Unexpected answer ignored");
                Ok(())
            }
            Err(e) => {
                drop(self.machine.enqueue(PhaseEvent::NegotiationFailed {
                    session_id: Some(session_id),
                    reason: e.to_string(),
                }));
                Err(e)
            }
        }
    }

    pub async fn on_remote_candidate(&self, session_id: SessionId, candidate: IceCandidate) -> CallResult<()> {
        if !self.in_phase(&[Phase::Connecting, Phase::Connected], "ice-candidate") {
            return Ok(());
        }
        let handle = self.registry.get(&session_id).ok_or_else(|| self.unknown(&session_id))?;
        let outcome = handle.guard.add_remote_candidate(candidate).await?;
        debug!(session_id = %session_id, outcome = ?outcome, "Remote candidate handled");
        Ok(())
    }

    pub async fn on_transport_disconnected(&self, reason: Option<String>) -> CallResult<()> {
        let phase = self.machine.phase();
        let reason = reason.unwrap_or_else(|| "signaling connection lost".to_string());
        match phase {
            Phase::Calling | Phase::Connecting => {
                warn!(phase = ?phase, reason = %reason, "Signaling lost during call setup");
                self.machine
                    .handle_event(PhaseEvent::ConnectionFailed {
                        session_id: self.machine.session_id(),
                        reason,
                    })
                    .await
                    .map(|_| ())
            }
            Phase::Connected => {
                // Media flows peer to peer; the call survives until media health says otherwise
                warn!(reason = %reason, "Signaling lost while connected");
                Ok(())
            }
            _ => {
                debug!(phase = ?phase, reason = %reason, "Signaling disconnected");
                Ok(())
            }
        }
    }

    /// Role and phase gate for remote notifications
    fn expects(&self, role: CallRole, phases: &[Phase], notification: &str) -> bool {
        let Some(session) = self.machine.session() else {
            debug!(notification, phase = ?self.machine.phase(), "Ignoring notification without an active call");
            return false;
        };
        if session.role != role {
            debug!(notification, role = ?session.role, "Ignoring notification meant for the other role");
            return false;
        }
        self.in_phase(phases, notification)
    }

    /// Phase gate for notifications either role may receive
    fn in_phase(&self, phases: &[Phase], notification: &str) -> bool {
        let phase = self.machine.phase();
        if self.machine.session().is_none() || !phases.contains(&phase) {
            debug!(notification, phase = ?phase, "Ignoring notification in this phase");
            return false;
        }
        true
    }

    fn unknown(&self, session_id: &SessionId) -> CallError {
        CallError::StaleReference {
            active: self.machine.session_id(),
            received: session_id.clone(),
        }
    }
}
