//! Shared fakes for integration tests
//!
//! `Switchboard` plays the signaling server between any number of identities.
//! `FakeMediaEngine` hands out peers that report `Connected` as soon as both
//! descriptions are in place.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};

use rvoip_call_session_core::{
    CallError, CallKind, CallOrchestrator, CallResult, IceCandidate, MediaEngine, MediaStream,
    OrchestratorBuilder, OrchestratorConfig, PeerConnection, PeerConnectionEvent, PeerConnectionState,
    Phase, PhaseMachineConfig, RetryConfig, SessionDescription, SessionId, SignalingChannel,
    SignalingMessage, SignalingNotification, LocalParty,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rvoip_call_session_core=debug")
        .with_test_writer()
        .try_init();
}

/// Timeouts short enough for tests, no bootstrap retries
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_call_setup_timeout(Duration::from_secs(5))
        .with_negotiation_timeout(Duration::from_secs(5))
        .with_teardown_timeout(Duration::from_millis(500))
        .with_retry(RetryConfig::none())
        .with_machine(PhaseMachineConfig::default().with_terminal_grace(Duration::from_millis(150)))
}

struct CallRecord {
    caller: String,
    callee: String,
}

/// In-memory signaling server
#[derive(Default)]
pub struct Switchboard {
    parties: Mutex<HashMap<String, broadcast::Sender<SignalingNotification>>>,
    calls: Mutex<HashMap<SessionId, CallRecord>>,
    sent: Mutex<Vec<(String, SignalingMessage)>>,
    next_id: AtomicU64,
}

impl Switchboard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every message sent by `identity`, in order
    pub fn sent_by(&self, identity: &str) -> Vec<SignalingMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|(from, _)| from == identity)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn sent_events(&self, identity: &str) -> Vec<&'static str> {
        self.sent_by(identity).iter().map(|m| m.event_name()).collect()
    }

    fn deliver(&self, to: &str, notification: SignalingNotification) {
        if let Some(tx) = self.parties.lock().get(to) {
            let _ = tx.send(notification);
        }
    }

    fn counterpart(&self, session_id: &SessionId, me: &str) -> Option<String> {
        let calls = self.calls.lock();
        let record = calls.get(session_id)?;
        Some(if record.caller == me { record.callee.clone() } else { record.caller.clone() })
    }

    fn route(&self, from: &FakeSignaling, message: SignalingMessage) {
        self.sent.lock().push((from.identity.clone(), message.clone()));

        match message {
            SignalingMessage::InitiateCall { remote_id, call_kind, .. } => {
                let session_id = SessionId::from(format!("srv-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1));
                self.calls.lock().insert(
                    session_id.clone(),
                    CallRecord {
                        caller: from.identity.clone(),
                        callee: remote_id.clone(),
                    },
                );
                self.deliver(
                    &remote_id,
                    SignalingNotification::CallRequest {
                        session_id,
                        from_id: from.identity.clone(),
                        from_name: from.display_name.clone(),
                        call_kind,
                    },
                );
            }
            SignalingMessage::AcceptCall { session_id } => {
                let record = self
                    .calls
                    .lock()
                    .get(&session_id)
                    .map(|r| (r.caller.clone(), r.callee.clone()));
                if let Some((caller, callee)) = record {
                    for party in [caller, callee] {
                        self.deliver(&party, SignalingNotification::CallAccepted { session_id: session_id.clone() });
                    }
                }
            }
            SignalingMessage::RejectCall { session_id, reason } => {
                if let Some(other) = self.counterpart(&session_id, &from.identity) {
                    self.deliver(
                        &other,
                        SignalingNotification::CallRejected {
                            session_id,
                            reason: Some(reason),
                        },
                    );
                }
            }
            SignalingMessage::CancelCall { remote_id, reason, .. } => {
                let session_id = self
                    .calls
                    .lock()
                    .iter()
                    .find(|(_, r)| r.caller == from.identity && r.callee == remote_id)
                    .map(|(id, _)| id.clone());
                self.deliver(
                    &remote_id,
                    SignalingNotification::CallCancelled {
                        session_id,
                        from_id: Some(from.identity.clone()),
                        reason: Some(reason),
                    },
                );
            }
            SignalingMessage::EndCall { session_id, .. } => {
                if let Some(other) = self.counterpart(&session_id, &from.identity) {
                    self.deliver(
                        &other,
                        SignalingNotification::CallEnded {
                            session_id,
                            reason: Some("remote hangup".to_string()),
                            ended_by: Some(from.identity.clone()),
                        },
                    );
                }
            }
            SignalingMessage::Offer { session_id, sdp } => {
                if let Some(other) = self.counterpart(&session_id, &from.identity) {
                    self.deliver(&other, SignalingNotification::Offer { session_id, sdp });
                }
            }
            SignalingMessage::Answer { session_id, sdp } => {
                if let Some(other) = self.counterpart(&session_id, &from.identity) {
                    self.deliver(&other, SignalingNotification::Answer { session_id, sdp });
                }
            }
            SignalingMessage::IceCandidate { session_id, candidate } => {
                if let Some(other) = self.counterpart(&session_id, &from.identity) {
                    self.deliver(&other, SignalingNotification::IceCandidate { session_id, candidate });
                }
            }
        }
    }
}

/// One identity's connection to the switchboard
pub struct FakeSignaling {
    pub identity: String,
    pub display_name: String,
    board: Arc<Switchboard>,
    tx: broadcast::Sender<SignalingNotification>,
    /// Number of upcoming `connect` calls that fail
    pub connect_failures: AtomicU32,
    pub connect_attempts: AtomicU32,
    pub disconnects: AtomicU32,
    /// Outbound messages are lost when set
    pub drop_outbound: AtomicBool,
}

impl FakeSignaling {
    pub fn new(board: &Arc<Switchboard>, identity: &str, display_name: &str) -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            identity: identity.to_string(),
            display_name: display_name.to_string(),
            board: board.clone(),
            tx,
            connect_failures: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            drop_outbound: AtomicBool::new(false),
        })
    }

    /// Push a notification straight to this identity
    pub fn inject(&self, notification: SignalingNotification) {
        let _ = self.tx.send(notification);
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn connect(&self) -> CallResult<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CallError::signaling_failed("switchboard unreachable"));
        }
        self.board.parties.lock().insert(self.identity.clone(), self.tx.clone());
        Ok(())
    }

    async fn send(&self, message: SignalingMessage) -> CallResult<()> {
        if self.drop_outbound.load(Ordering::SeqCst) {
            self.board.sent.lock().push((self.identity.clone(), message));
            return Ok(());
        }
        self.board.route(self, message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingNotification> {
        self.tx.subscribe()
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.board.parties.lock().remove(&self.identity);
    }
}

/// Peer that connects once it has both a local and a remote description
pub struct FakePeer {
    events: mpsc::UnboundedSender<PeerConnectionEvent>,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    connected: AtomicBool,
    pub closed: AtomicBool,
    pub remote_candidates: Mutex<Vec<IceCandidate>>,
}

impl FakePeer {
    fn maybe_connect(&self) {
        if self.has_local.load(Ordering::SeqCst)
            && self.has_remote.load(Ordering::SeqCst)
            && !self.connected.swap(true, Ordering::SeqCst)
        {
            let _ = self
                .events
                .send(PeerConnectionEvent::RemoteStream(MediaStream::new("remote-audio")));
            let _ = self
                .events
                .send(PeerConnectionEvent::ConnectionStateChanged(PeerConnectionState::Connected));
        }
    }

    /// Simulate the media path dropping
    pub fn drop_connection(&self) {
        let _ = self
            .events
            .send(PeerConnectionEvent::ConnectionStateChanged(PeerConnectionState::Disconnected));
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_stream(&self, _stream: &MediaStream) -> CallResult<()> {
        Ok(())
    }

    async fn create_offer(&self) -> CallResult<SessionDescription> {
        self.has_local.store(true, Ordering::SeqCst);
        let _ = self.events.send(PeerConnectionEvent::LocalIceCandidate(IceCandidate::new(
            "candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host",
        )));
        self.maybe_connect();
        Ok(SessionDescription::offer("v=0 offer"))
    }

    async fn create_answer(&self, _remote_offer: &SessionDescription) -> CallResult<SessionDescription> {
        self.has_local.store(true, Ordering::SeqCst);
        let _ = self.events.send(PeerConnectionEvent::LocalIceCandidate(IceCandidate::new(
            "candidate:1 1 udp 2122260223 10.0.0.2 50002 typ host",
        )));
        self.maybe_connect();
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_remote_description(&self, _description: &SessionDescription) -> CallResult<()> {
        self.has_remote.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> CallResult<()> {
        self.remote_candidates.lock().push(candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeMediaEngine {
    pub init_failures: AtomicU32,
    pub acquire_error: Mutex<Option<CallError>>,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub peers: Mutex<Vec<Arc<FakePeer>>>,
    /// When set, stream acquisition waits for a permit (a never-answered prompt)
    acquire_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeMediaEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_acquire_with(&self, error: CallError) {
        *self.acquire_error.lock() = Some(error);
    }

    /// Hold every upcoming acquisition until the returned gate is notified
    pub fn hold_acquire(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.acquire_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn initialize(&self) -> CallResult<()> {
        let failing = self
            .init_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CallError::internal("audio subsystem not ready"));
        }
        Ok(())
    }

    async fn acquire_local_stream(&self, _kind: CallKind) -> CallResult<MediaStream> {
        let gate = self.acquire_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(error) = self.acquire_error.lock().clone() {
            return Err(error);
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MediaStream::new(format!("mic-{}", n)))
    }

    async fn release_local_stream(&self, _stream: &MediaStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    async fn create_peer_connection(
        &self,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> CallResult<Arc<dyn PeerConnection>> {
        let peer = Arc::new(FakePeer {
            events,
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            remote_candidates: Mutex::new(Vec::new()),
        });
        self.peers.lock().push(peer.clone());
        Ok(peer as Arc<dyn PeerConnection>)
    }
}

/// An orchestrator wired to the switchboard, with handles to its fakes
pub struct Party {
    pub orchestrator: Arc<CallOrchestrator>,
    pub signaling: Arc<FakeSignaling>,
    pub media: Arc<FakeMediaEngine>,
}

impl Party {
    pub fn build(board: &Arc<Switchboard>, local: LocalParty, config: OrchestratorConfig) -> Self {
        let signaling = FakeSignaling::new(board, &local.id, &local.display_name);
        let media = FakeMediaEngine::new();
        let orchestrator = OrchestratorBuilder::new()
            .local_party(local)
            .signaling(signaling.clone())
            .media(media.clone())
            .config(config)
            .build()
            .expect("failed to build orchestrator");
        Self {
            orchestrator,
            signaling,
            media,
        }
    }

    /// Build and initialize with the test configuration
    pub async fn online(board: &Arc<Switchboard>, id: &str, name: &str) -> Self {
        let party = Self::build(board, LocalParty::new(id, name), test_config());
        party.orchestrator.initialize().await.expect("failed to initialize");
        party
    }

    pub async fn wait_for(&self, phase: Phase) {
        tokio::time::timeout(Duration::from_secs(5), self.orchestrator.phase_machine().wait_for(phase))
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "{} never reached {:?}, stuck in {:?}",
                    self.signaling.identity,
                    phase,
                    self.orchestrator.phase()
                )
            })
            .expect("phase machine stopped");
    }

    /// True if the machine ever entered `phase`
    pub fn visited(&self, phase: Phase) -> bool {
        self.orchestrator.history().iter().any(|record| record.to == phase)
    }
}

/// Poll `condition` until it holds or a few seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
