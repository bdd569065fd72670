//! Negotiation guard: owns the peer connection and local stream for one session
//!
//! The guard decides whether an SDP operation may run, never the other party:
//!
//! - only the caller offers, at most once per session (the latch is set before
//!   the offer is created and never reset)
//! - a remote offer while both descriptions are set is a duplicate and ignored
//! - a remote offer while a local offer is pending is glare; the local offer wins
//! - remote candidates that arrive before the remote description are queued and
//!   flushed in arrival order right after it is applied
//!
//! Peer callbacks are relayed as [`GuardEvent`]s tagged with the guard's
//! generation so the orchestrator can ignore events from a previous session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::context::NegotiationContext;
use crate::error::{CallError, CallResult};
use crate::media::{
    IceCandidate, IceConnectionState, MediaEngine, MediaStream, PeerConnection, PeerConnectionEvent,
    PeerConnectionState, SessionDescription,
};
use crate::session::CallRole;

/// Coarse media path health derived from connection and ICE state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationHealth {
    Established,
    Failed,
    /// Transient loss; the path may or may not come back
    Lost,
}

impl NegotiationHealth {
    pub fn from_connection_state(state: PeerConnectionState) -> Option<Self> {
        match state {
            PeerConnectionState::Connected => Some(Self::Established),
            PeerConnectionState::Failed => Some(Self::Failed),
            PeerConnectionState::Disconnected => Some(Self::Lost),
            _ => None,
        }
    }

    pub fn from_ice_state(state: IceConnectionState) -> Option<Self> {
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => Some(Self::Established),
            IceConnectionState::Failed => Some(Self::Failed),
            IceConnectionState::Disconnected => Some(Self::Lost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardNotification {
    LocalCandidate(IceCandidate),
    RemoteStream(MediaStream),
    Health(NegotiationHealth),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuardEvent {
    pub generation: u64,
    pub notification: GuardNotification,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OfferOutcome {
    Created(SessionDescription),
    AlreadyInitiated,
    /// The callee never offers
    NotPermitted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOfferOutcome {
    Answered(SessionDescription),
    IgnoredDuplicate,
    IgnoredGlare,
    IgnoredWrongRole,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteAnswerOutcome {
    Applied,
    /// No local offer is waiting for an answer
    IgnoredUnexpected,
}

/// Early remote candidates held per session; the oldest is dropped beyond this
pub const MAX_QUEUED_REMOTE_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Queued,
    Applied,
}

pub struct NegotiationGuard {
    generation: u64,
    role: CallRole,
    engine: Arc<dyn MediaEngine>,
    peer: OnceCell<Arc<dyn PeerConnection>>,
    context: AsyncMutex<NegotiationContext>,
    local_stream: Mutex<Option<MediaStream>>,
    notifier: mpsc::UnboundedSender<GuardEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for NegotiationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationGuard")
            .field("generation", &self.generation)
            .field("role", &self.role)
            .field("has_peer", &self.peer.initialized())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl NegotiationGuard {
    pub fn new(
        generation: u64,
        role: CallRole,
        engine: Arc<dyn MediaEngine>,
        notifier: mpsc::UnboundedSender<GuardEvent>,
    ) -> Self {
        Self {
            generation,
            role,
            engine,
            peer: OnceCell::new(),
            context: AsyncMutex::new(NegotiationContext::new(role)),
            local_stream: Mutex::new(None),
            notifier,
            pump: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.local_stream.lock().clone()
    }

    /// Snapshot of the negotiation state
    pub async fn context(&self) -> NegotiationContext {
        self.context.lock().await.clone()
    }

    /// The peer connection, created on first use
    async fn peer(&self) -> CallResult<Arc<dyn PeerConnection>> {
        if self.is_closed() {
            return Err(CallError::negotiation_failed("negotiation already closed"));
        }

        self.peer
            .get_or_try_init(|| async {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let peer = self.engine.create_peer_connection(events_tx).await?;
                let pump = tokio::spawn(pump_peer_events(events_rx, self.generation, self.notifier.clone()));
                *self.pump.lock() = Some(pump);
                debug!(generation = self.generation, role = ?self.role, "Peer connection created");
                Ok::<_, CallError>(peer)
            })
            .await
            .cloned()
    }

    /// Hand the acquired microphone stream to the peer connection.
    /// On failure the stream is released again.
    pub async fn attach_local_stream(&self, stream: MediaStream) -> CallResult<()> {
        let attached = match self.peer().await {
            Ok(peer) => peer.add_local_stream(&stream).await,
            Err(e) => Err(e),
        };

        if let Err(e) = attached {
            warn!(generation = self.generation, error = %e, "Failed to attach local stream");
            self.engine.release_local_stream(&stream).await;
            return Err(e);
        }

        let previous = self.local_stream.lock().replace(stream);
        if let Some(previous) = previous {
            self.engine.release_local_stream(&previous).await;
        }
        // Closed while attaching: close() may have missed the stream
        if self.is_closed() {
            let stream = self.local_stream.lock().take();
            if let Some(stream) = stream {
                self.engine.release_local_stream(&stream).await;
            }
            return Err(CallError::negotiation_failed("negotiation closed while attaching media"));
        }
        Ok(())
    }

    /// Create the local offer, once, if this side is the caller
    pub async fn initiate_offer(&self) -> CallResult<OfferOutcome> {
        if self.role != CallRole::Caller {
            debug!(generation = self.generation, "Callee does not offer");
            return Ok(OfferOutcome::NotPermitted);
        }

        let mut ctx = self.context.lock().await;
        if ctx.offer_initiated {
            debug!(generation = self.generation, "Offer already initiated");
            return Ok(OfferOutcome::AlreadyInitiated);
        }
        ctx.offer_initiated = true;

        let peer = self.peer().await?;
        let offer = peer.create_offer().await?;
        ctx.has_local_description = true;

        info!(generation = self.generation, "Local offer created");
        Ok(OfferOutcome::Created(offer))
    }

    /// Apply a remote offer and produce the answer
    pub async fn apply_remote_offer(&self, offer: &SessionDescription) -> CallResult<RemoteOfferOutcome> {
        let mut ctx = self.context.lock().await;

        if ctx.is_stable() {
            debug!(generation = self.generation, "Ignoring duplicate remote offer");
            return Ok(RemoteOfferOutcome::IgnoredDuplicate);
        }
        if ctx.has_pending_local_offer() {
            warn!(generation = self.generation, "Remote offer collided with local offer, keeping local");
            return Ok(RemoteOfferOutcome::IgnoredGlare);
        }
        if self.role == CallRole::Caller {
            warn!(generation = self.generation, "Caller received an offer, ignoring");
            return Ok(RemoteOfferOutcome::IgnoredWrongRole);
        }

        let peer = self.peer().await?;
        peer.set_remote_description(offer).await?;
        ctx.has_remote_description = true;
        self.flush_candidates(&peer, &mut ctx).await;

        let answer = peer.create_answer(offer).await?;
        ctx.has_local_description = true;

        info!(generation = self.generation, "Remote offer answered");
        Ok(RemoteOfferOutcome::Answered(answer))
    }

    pub async fn apply_remote_answer(&self, answer: &SessionDescription) -> CallResult<RemoteAnswerOutcome> {
        let mut ctx = self.context.lock().await;

        if self.role != CallRole::Caller || !ctx.has_pending_local_offer() {
            debug!(
                generation = self.generation,
                stable = ctx.is_stable(),
                "Ignoring unexpected remote answer"
            );
            return Ok(RemoteAnswerOutcome::IgnoredUnexpected);
        }

        let peer = self.peer().await?;
        peer.set_remote_description(answer).await?;
        ctx.has_remote_description = true;
        self.flush_candidates(&peer, &mut ctx).await;

        info!(generation = self.generation, "Remote answer applied");
        Ok(RemoteAnswerOutcome::Applied)
    }

    /// Apply a remote candidate, or queue it until the remote description is set
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> CallResult<CandidateOutcome> {
        let mut ctx = self.context.lock().await;

        if !ctx.has_remote_description {
            if ctx.queued_remote_candidates.len() >= MAX_QUEUED_REMOTE_CANDIDATES {
                if let Some(dropped) = ctx.queued_remote_candidates.pop_front() {
                    warn!(
                        generation = self.generation,
                        dropped = %dropped.candidate,
                        limit = MAX_QUEUED_REMOTE_CANDIDATES,
                        "Early candidate queue full, dropping the oldest"
                    );
                }
            }
            ctx.queued_remote_candidates.push_back(candidate);
            trace!(
                generation = self.generation,
                queued = ctx.queued_remote_candidates.len(),
                "Queued early remote candidate"
            );
            return Ok(CandidateOutcome::Queued);
        }

        let peer = self.peer().await?;
        peer.add_ice_candidate(&candidate).await?;
        Ok(CandidateOutcome::Applied)
    }

    async fn flush_candidates(&self, peer: &Arc<dyn PeerConnection>, ctx: &mut NegotiationContext) {
        let queued = ctx.queued_remote_candidates.len();
        while let Some(candidate) = ctx.queued_remote_candidates.pop_front() {
            if let Err(e) = peer.add_ice_candidate(&candidate).await {
                warn!(generation = self.generation, error = %e, "Failed to apply queued candidate");
            }
        }
        if queued > 0 {
            debug!(generation = self.generation, count = queued, "Flushed queued remote candidates");
        }
    }

    /// Close the peer connection and release the local stream. Best-effort and idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if let Some(peer) = self.peer.get() {
            peer.close().await;
        }
        let stream = self.local_stream.lock().take();
        if let Some(stream) = stream {
            self.engine.release_local_stream(&stream).await;
        }
        debug!(generation = self.generation, "Negotiation closed");
    }
}

/// Relay peer callbacks as guard events, collapsing repeated health reports
async fn pump_peer_events(
    mut events: mpsc::UnboundedReceiver<PeerConnectionEvent>,
    generation: u64,
    notifier: mpsc::UnboundedSender<GuardEvent>,
) {
    let mut last_health = None;

    while let Some(event) = events.recv().await {
        let health = match &event {
            PeerConnectionEvent::ConnectionStateChanged(state) => NegotiationHealth::from_connection_state(*state),
            PeerConnectionEvent::IceConnectionStateChanged(state) => NegotiationHealth::from_ice_state(*state),
            _ => None,
        };

        let notification = match event {
            PeerConnectionEvent::LocalIceCandidate(candidate) => GuardNotification::LocalCandidate(candidate),
            PeerConnectionEvent::RemoteStream(stream) => GuardNotification::RemoteStream(stream),
            _ => match health {
                Some(health) if last_health != Some(health) => {
                    last_health = Some(health);
                    GuardNotification::Health(health)
                }
                _ => continue,
            },
        };

        if notifier.send(GuardEvent { generation, notification }).is_err() {
            break;
        }
    }
}
