//! Side effects of entering a phase
//!
//! Runs synchronously inside the machine's listener callback. Anything that
//! awaits is spawned so the drain loop never waits on I/O.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, trace, warn};

use super::registry::SessionHandle;
use super::CallOrchestrator;
use crate::error::CallError;
use crate::events::CallEvent;
use crate::negotiation::{GuardEvent, GuardNotification, NegotiationGuard, NegotiationHealth, OfferOutcome};
use crate::phase::{EventKind, Phase, PhaseEvent, PhaseTransition, TimeoutKind};
use crate::recovery::with_timeout;
use crate::session::{CallRole, RemoteParty, SessionId};
use crate::signaling::SignalingMessage;

impl CallOrchestrator {
    pub(super) fn on_transition(self: &Arc<Self>, transition: &PhaseTransition) {
        self.track_session(transition);
        self.stats.record(transition);
        self.emit(CallEvent::PhaseChanged(transition.clone()));

        let session_id = transition.session_id().cloned();
        match transition.phase {
            Phase::Idle => self.timeouts.clear_all(),
            Phase::Initiating => {}
            Phase::Calling => {
                self.timeouts
                    .arm(TimeoutKind::CallSetup, self.config.call_setup_timeout, session_id);
            }
            Phase::Ringing => {
                self.timeouts
                    .arm(TimeoutKind::CallSetup, self.config.call_setup_timeout, session_id);
                if let Some(session) = &transition.session {
                    self.emit(CallEvent::IncomingCall {
                        session_id: session.session_id.clone(),
                        remote: RemoteParty::new(
                            session.remote_party_id.clone(),
                            session.remote_party_display_name.clone(),
                        ),
                        call_kind: session.call_kind,
                    });
                }
            }
            Phase::Connecting => {
                self.timeouts.clear(TimeoutKind::CallSetup);
                self.timeouts.arm(
                    TimeoutKind::Negotiation,
                    self.config.negotiation_timeout,
                    session_id.clone(),
                );
                let is_caller = transition
                    .session
                    .as_ref()
                    .is_some_and(|session| session.role == CallRole::Caller);
                if let (true, Some(session_id)) = (is_caller, session_id) {
                    self.spawn_offer(session_id);
                }
            }
            Phase::Connected => self.timeouts.clear(TimeoutKind::Negotiation),
            Phase::Disconnecting => {
                self.timeouts.clear_all();
                self.spawn_teardown(transition);
            }
            Phase::Ended | Phase::Failed | Phase::Rejected => {
                self.timeouts.clear_all();
                if let Some(session_id) = &session_id {
                    self.spawn_guard_close(session_id);
                }
                if transition.phase == Phase::Failed {
                    let error = transition
                        .metadata
                        .event
                        .failure()
                        .unwrap_or_else(|| CallError::internal("call failed"));
                    warn!(
                        session_id = ?session_id.as_ref().map(|id| id.as_str()),
                        reason_code = error.reason_code(),
                        error = %error,
                        "Call failed"
                    );
                    self.emit(CallEvent::CallFailed { session_id, error });
                }
            }
        }
    }

    /// Keep the registry in step with the session lifecycle
    fn track_session(&self, transition: &PhaseTransition) {
        if let (Some(old), Some(new)) = (&transition.metadata.superseded_id, transition.session_id()) {
            self.registry.rekey(old, new.clone());
        }

        if transition.previous == Phase::Idle {
            if let Some(session) = &transition.session {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let guard = NegotiationGuard::new(
                    generation,
                    session.role,
                    self.media.clone(),
                    self.guard_tx.clone(),
                );
                self.registry.insert(
                    session.session_id.clone(),
                    Arc::new(SessionHandle {
                        generation,
                        role: session.role,
                        guard: Arc::new(guard),
                        created_at: Utc::now(),
                    }),
                );
            }
        }

        if transition.phase == Phase::Idle {
            if let Some(id) = transition.session_id() {
                if let Some(handle) = self.registry.remove(id) {
                    debug!(session_id = %id, generation = handle.generation, "Session handle released");
                    tokio::spawn(async move { handle.guard.close().await });
                }
            }
        }
    }

    fn spawn_guard_close(&self, session_id: &SessionId) {
        if let Some(handle) = self.registry.get(session_id) {
            tokio::spawn(async move { handle.guard.close().await });
        }
    }

    fn spawn_offer(self: &Arc<Self>, session_id: SessionId) {
        let Some(handle) = self.registry.get(&session_id) else {
            warn!(session_id = %session_id, "No session handle for offer");
            return;
        };
        let orchestrator = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Some(orchestrator) = orchestrator.upgrade() {
                orchestrator.run_offer(session_id, handle).await;
            }
        });
    }

    async fn run_offer(&self, session_id: SessionId, handle: Arc<SessionHandle>) {
        let offer = match handle.guard.initiate_offer().await {
            Ok(OfferOutcome::Created(offer)) => offer,
            Ok(outcome) => {
                debug!(session_id = %session_id, outcome = ?outcome, "No offer sent");
                return;
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to create offer");
                drop(self.machine.enqueue(PhaseEvent::NegotiationFailed {
                    session_id: Some(session_id),
                    reason: e.to_string(),
                }));
                return;
            }
        };

        drop(self.machine.enqueue(PhaseEvent::NegotiationStarted {
            session_id: Some(session_id.clone()),
        }));

        let message = SignalingMessage::Offer {
            session_id: session_id.clone(),
            sdp: offer.sdp,
        };
        if let Err(e) = self.signaling.send(message).await {
            warn!(session_id = %session_id, error = %e, "Failed to send offer");
            drop(self.machine.enqueue(PhaseEvent::ConnectionFailed {
                session_id: Some(session_id),
                reason: format!("failed to send offer: {}", e),
            }));
        }
    }

    /// Graceful wind-down: notify the peer if needed, close media, then end
    fn spawn_teardown(self: &Arc<Self>, transition: &PhaseTransition) {
        let Some(session) = transition.session.clone() else {
            return;
        };
        let lost = transition.metadata.event.kind() == EventKind::NegotiationLost;
        let handle = self.registry.get(&session.session_id);
        let orchestrator = Arc::downgrade(self);

        tokio::spawn(async move {
            let Some(orchestrator) = orchestrator.upgrade() else {
                return;
            };
            let session_id = session.session_id.clone();

            if lost {
                orchestrator
                    .send_best_effort(SignalingMessage::EndCall {
                        session_id: session_id.clone(),
                        duration_seconds: session.connected_duration_secs(Utc::now()),
                    })
                    .await;
            }

            if let Some(handle) = handle {
                let closing = async {
                    handle.guard.close().await;
                    Ok(())
                };
                if let Err(e) =
                    with_timeout("teardown", orchestrator.config.teardown_timeout, closing).await
                {
                    warn!(session_id = %session_id, error = %e, "Media teardown did not finish");
                }
            }

            let reason = if lost { "media connection lost" } else { "local hangup" };
            if let Err(e) = orchestrator
                .machine
                .handle_event(PhaseEvent::CallEnded {
                    session_id: Some(session_id.clone()),
                    reason: Some(reason.to_string()),
                })
                .await
            {
                debug!(session_id = %session_id, error = %e, "Teardown completion superseded");
            }
            info!(session_id = %session_id, reason, "Call torn down");
        });
    }

    /// Translate negotiation guard output into signaling and phase events
    pub(super) async fn on_guard_event(&self, event: GuardEvent) {
        let Some((session_id, _handle)) = self.registry.find_by_generation(event.generation) else {
            trace!(generation = event.generation, "Dropping event from a retired negotiation");
            return;
        };

        match event.notification {
            GuardNotification::LocalCandidate(candidate) => {
                let message = SignalingMessage::IceCandidate {
                    session_id: session_id.clone(),
                    candidate,
                };
                if let Err(e) = self.signaling.send(message).await {
                    warn!(session_id = %session_id, error = %e, "Failed to send local candidate");
                }
            }
            GuardNotification::RemoteStream(stream) => {
                info!(session_id = %session_id, stream_id = %stream.id, "Remote audio arrived");
                self.emit(CallEvent::RemoteStream {
                    session_id: Some(session_id),
                    stream,
                });
            }
            GuardNotification::Health(health) => {
                let event = match health {
                    NegotiationHealth::Established => PhaseEvent::NegotiationEstablished {
                        session_id: Some(session_id),
                    },
                    NegotiationHealth::Failed => PhaseEvent::NegotiationFailed {
                        session_id: Some(session_id),
                        reason: "media connection failed".to_string(),
                    },
                    NegotiationHealth::Lost => PhaseEvent::NegotiationLost {
                        session_id: Some(session_id),
                    },
                };
                drop(self.machine.enqueue(event));
            }
        }
    }
}
