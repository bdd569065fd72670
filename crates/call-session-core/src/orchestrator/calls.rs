use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::registry::SessionHandle;
use super::CallOrchestrator;
use crate::error::{CallError, CallResult, MediaFailureKind};
use crate::media::MediaStream;
use crate::phase::{EventKind, Phase, PhaseEvent, ResetReason};
use crate::recovery::with_timeout;
use crate::session::{CallKind, RemoteParty, SessionId};
use crate::signaling::SignalingMessage;

/// Local intents
impl CallOrchestrator {
    /// Place a call to `remote_id`
    ///
    /// Returns the temporary session id. The transport-assigned id replaces it
    /// when the remote party accepts.
    pub async fn start_call(
        &self,
        remote_id: impl Into<String>,
        display_name: impl Into<String>,
        call_kind: CallKind,
    ) -> CallResult<SessionId> {
        if !self.local.can_place_calls {
            return Err(CallError::PermissionDenied {
                operation: "start_call".to_string(),
            });
        }
        self.ensure_initialized()?;

        let phase = self.machine.phase();
        if phase != Phase::Idle {
            return Err(CallError::InvalidTransition {
                phase,
                event: EventKind::StartCall,
            });
        }

        let remote = RemoteParty::new(remote_id, display_name);
        let session_id = SessionId::temporary();
        self.machine
            .handle_event(PhaseEvent::StartCall {
                session_id: session_id.clone(),
                remote: remote.clone(),
                call_kind,
            })
            .await?;
        info!(session_id = %session_id, remote_id = %remote.id, "Starting call");

        let stream = match self.acquire_stream(call_kind).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_media(&session_id, &e).await;
                return Err(e);
            }
        };

        // Hang-up or reset while the microphone was being acquired
        let Some(handle) = self.live_handle(&session_id, Phase::Initiating) else {
            self.media.release_local_stream(&stream).await;
            return Err(self.superseded(&session_id));
        };
        if let Err(e) = handle.guard.attach_local_stream(stream).await {
            if !self.is_live(&session_id) {
                return Err(self.superseded(&session_id));
            }
            self.fail_media(&session_id, &e).await;
            return Err(e);
        }

        if let Err(e) = self
            .machine
            .handle_event(PhaseEvent::MediaAcquired {
                session_id: session_id.clone(),
            })
            .await
        {
            if !self.is_live(&session_id) {
                return Err(self.superseded(&session_id));
            }
            return Err(e);
        }

        let _signaling = self.signaling_lock.lock().await;
        // Hang-up between MediaAcquired and the request going out
        if self.live_handle(&session_id, Phase::Calling).is_none() {
            return Err(self.superseded(&session_id));
        }

        let initiate = SignalingMessage::InitiateCall {
            remote_id: remote.id.clone(),
            call_kind,
            timestamp: Utc::now(),
            session_id: session_id.clone(),
        };
        if let Err(e) = self.send_setup(initiate).await {
            error!(session_id = %session_id, error = %e, "Failed to send call request");
            let _ = self
                .machine
                .handle_event(PhaseEvent::ConnectionFailed {
                    session_id: Some(session_id.clone()),
                    reason: e.to_string(),
                })
                .await;
            return Err(as_signaling_error(e));
        }

        // Reset while the request was in flight: withdraw it
        if self.registry.find_by_generation(handle.generation).is_none() {
            self.send_best_effort(SignalingMessage::CancelCall {
                remote_id: remote.id.clone(),
                reason: "cancelled".to_string(),
                timestamp: Utc::now(),
            })
            .await;
            return Err(self.superseded(&session_id));
        }

        Ok(session_id)
    }

    /// Answer the call that is ringing locally
    pub async fn accept_call(&self, session_id: &SessionId) -> CallResult<()> {
        if !self.local.can_receive_calls {
            return Err(CallError::PermissionDenied {
                operation: "accept_call".to_string(),
            });
        }
        self.ensure_initialized()?;

        let phase = self.machine.phase();
        if phase != Phase::Ringing {
            return Err(CallError::InvalidTransition {
                phase,
                event: EventKind::AcceptCall,
            });
        }
        let active = self.machine.session();
        if active.as_ref().map(|s| &s.session_id) != Some(session_id) {
            return Err(CallError::StaleReference {
                active: active.map(|s| s.session_id),
                received: session_id.clone(),
            });
        }
        let call_kind = active.map(|s| s.call_kind).unwrap_or_default();

        self.machine
            .handle_event(PhaseEvent::AcceptCall {
                session_id: session_id.clone(),
            })
            .await?;
        info!(session_id = %session_id, "Accepting call");

        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| CallError::internal("accepted session has no handle"))?;

        let stream = match self.acquire_stream(call_kind).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_accept(session_id, &e).await;
                return Err(e);
            }
        };
        // Caller gave up while the microphone was being acquired
        if self.live_handle(session_id, Phase::Connecting).is_none() {
            self.media.release_local_stream(&stream).await;
            return Err(self.superseded(session_id));
        }
        if let Err(e) = handle.guard.attach_local_stream(stream).await {
            self.fail_accept(session_id, &e).await;
            return Err(e);
        }

        let _signaling = self.signaling_lock.lock().await;
        if self.live_handle(session_id, Phase::Connecting).is_none() {
            return Err(self.superseded(session_id));
        }

        let accept = SignalingMessage::AcceptCall {
            session_id: session_id.clone(),
        };
        if let Err(e) = self.send_setup(accept).await {
            error!(session_id = %session_id, error = %e, "Failed to send accept");
            let _ = self
                .machine
                .handle_event(PhaseEvent::ConnectionFailed {
                    session_id: Some(session_id.clone()),
                    reason: e.to_string(),
                })
                .await;
            return Err(as_signaling_error(e));
        }
        Ok(())
    }

    /// Decline the call that is ringing locally
    ///
    /// The remote party is notified best-effort whatever the local outcome.
    pub async fn reject_call(&self, session_id: &SessionId) -> CallResult<()> {
        let applied = self
            .machine
            .handle_event(PhaseEvent::RejectCall {
                session_id: session_id.clone(),
                reason: Some("declined".to_string()),
            })
            .await;

        self.send_best_effort(SignalingMessage::RejectCall {
            session_id: session_id.clone(),
            reason: "declined".to_string(),
        })
        .await;

        match applied {
            Ok(_) => {
                info!(session_id = %session_id, "Call rejected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Hang up whatever call is active. Never fails on teardown errors.
    pub async fn end_call(&self) -> CallResult<()> {
        let _signaling = self.signaling_lock.lock().await;
        let phase = self.machine.phase();
        let Some(session) = self.machine.session() else {
            debug!(phase = ?phase, "No active call to end");
            return Ok(());
        };

        match phase {
            Phase::Idle | Phase::Disconnecting => return Ok(()),
            Phase::Ringing => return self.reject_call(&session.session_id).await,
            Phase::Ended | Phase::Failed | Phase::Rejected => {
                return self
                    .machine
                    .handle_event(PhaseEvent::Reset {
                        reason: ResetReason::Dismissed,
                    })
                    .await
                    .map(|_| ());
            }
            // The remote party has not heard of this call yet
            Phase::Initiating => {}
            Phase::Calling if session.is_temporary() => {
                self.send_best_effort(SignalingMessage::CancelCall {
                    remote_id: session.remote_party_id.clone(),
                    reason: "cancelled".to_string(),
                    timestamp: Utc::now(),
                })
                .await;
            }
            Phase::Calling | Phase::Connecting | Phase::Connected => {
                self.send_best_effort(SignalingMessage::EndCall {
                    session_id: session.session_id.clone(),
                    duration_seconds: session.connected_duration_secs(Utc::now()),
                })
                .await;
            }
        }

        match self.machine.handle_event(PhaseEvent::EndCall).await {
            Ok(phase) => {
                info!(session_id = %session.session_id, phase = ?phase, "Call ended locally");
                Ok(())
            }
            Err(e) if e.is_locally_recovered() => {
                debug!(session_id = %session.session_id, error = %e, "Hang-up raced another transition");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Handle for `session_id` if it is still the live session in `phase`
    fn live_handle(&self, session_id: &SessionId, phase: Phase) -> Option<Arc<SessionHandle>> {
        if self.machine.phase() != phase || !self.is_live(session_id) {
            return None;
        }
        self.registry.get(session_id)
    }

    /// Local stream acquisition bounded by the call-setup budget
    async fn acquire_stream(&self, call_kind: CallKind) -> CallResult<MediaStream> {
        let acquiring = self.media.acquire_local_stream(call_kind);
        with_timeout("acquire_local_stream", self.config.call_setup_timeout, acquiring).await
    }

    async fn send_setup(&self, message: SignalingMessage) -> CallResult<()> {
        let name = message.event_name();
        let sending = self.signaling.send(message);
        with_timeout(name, self.config.call_setup_timeout, sending).await
    }

    fn is_live(&self, session_id: &SessionId) -> bool {
        self.machine.session_id().as_ref() == Some(session_id)
    }

    fn superseded(&self, session_id: &SessionId) -> CallError {
        warn!(session_id = %session_id, "Session was superseded during call setup");
        CallError::StaleReference {
            active: self.machine.session_id(),
            received: session_id.clone(),
        }
    }

    async fn fail_media(&self, session_id: &SessionId, e: &CallError) {
        let (kind, reason) = match e {
            CallError::MediaAcquisitionFailed { kind, reason } => (*kind, reason.clone()),
            other => (MediaFailureKind::Other, other.to_string()),
        };
        warn!(session_id = %session_id, kind = ?kind, reason = %reason, "Local media unavailable");
        let _ = self
            .machine
            .handle_event(PhaseEvent::MediaFailed {
                session_id: Some(session_id.clone()),
                kind,
                reason,
            })
            .await;
    }

    /// Media failed after acceptance: fail locally and tell the caller
    async fn fail_accept(&self, session_id: &SessionId, e: &CallError) {
        warn!(session_id = %session_id, error = %e, "Local media unavailable after accepting");
        let _ = self
            .machine
            .handle_event(PhaseEvent::NegotiationFailed {
                session_id: Some(session_id.clone()),
                reason: format!("{}: {}", e.reason_code(), e),
            })
            .await;
        self.send_best_effort(SignalingMessage::RejectCall {
            session_id: session_id.clone(),
            reason: e.reason_code().to_string(),
        })
        .await;
    }
}

fn as_signaling_error(e: CallError) -> CallError {
    match e {
        CallError::SignalingFailed { .. } => e,
        other => CallError::signaling_failed(other.to_string()),
    }
}
