//! The phase machine
//!
//! All session mutation happens here, on a single drain task. Producers only
//! enqueue: [`PhaseMachine::enqueue`] is synchronous and returns a receiver for
//! the outcome, [`PhaseMachine::handle_event`] awaits it. Events are ordered by
//! priority then arrival, deduplicated at admission and validated against the
//! [`TransitionTable`] and the live/retired session ids before being applied.
//!
//! Listeners run synchronously on the drain task after each applied transition
//! and before the producer's future resolves. They must not block; anything
//! asynchronous belongs on a task of the listener's own.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::dedup::DedupCache;
use super::mailbox::{Admission, Mailbox, PendingEvent};
use super::table::TransitionTable;
use super::types::{EventKind, Phase, PhaseEvent, ResetReason};
use crate::error::{CallError, CallResult};
use crate::session::{CallSession, SessionId};

/// How many retired session ids are remembered for stale-reference checks
const RETIRED_ID_LIMIT: usize = 256;

/// Phase machine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMachineConfig {
    /// Bounded mailbox size
    pub mailbox_capacity: usize,
    /// Identical events admitted within this window are answered without re-applying
    pub dedup_window: Duration,
    /// Queued events older than this are discarded (except `Reset`)
    pub stale_after: Duration,
    /// Delay before a terminal phase resets itself to `Idle`
    pub terminal_grace: Duration,
    /// Number of applied transitions kept for `history()`
    pub history_limit: usize,
}

impl Default for PhaseMachineConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 50,
            dedup_window: Duration::from_millis(500),
            stale_after: Duration::from_secs(5),
            terminal_grace: Duration::from_secs(1),
            history_limit: 64,
        }
    }
}

impl PhaseMachineConfig {
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_terminal_grace(mut self, grace: Duration) -> Self {
        self.terminal_grace = grace;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}

/// Extra context delivered with every applied transition
#[derive(Debug, Clone)]
pub struct TransitionMetadata {
    /// The event that caused the transition
    pub event: PhaseEvent,
    pub at: DateTime<Utc>,
    /// The temporary id retired by this transition, when the session was re-keyed
    pub superseded_id: Option<SessionId>,
}

/// An applied transition as seen by listeners
#[derive(Debug, Clone)]
pub struct PhaseTransition {
    pub phase: Phase,
    pub previous: Phase,
    /// Session after the event was applied. On the way back to `Idle` this is the
    /// final snapshot of the session that was just cleared.
    pub session: Option<CallSession>,
    pub metadata: TransitionMetadata,
}

impl PhaseTransition {
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session.as_ref().map(|s| &s.session_id)
    }
}

/// Entry in the transition history ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Phase,
    pub to: Phase,
    pub event: EventKind,
    pub session_id: Option<SessionId>,
    pub at: DateTime<Utc>,
}

/// Receives every applied transition
pub trait PhaseListener: Send + Sync {
    fn on_transition(&self, transition: &PhaseTransition);
}

impl<F> PhaseListener for F
where
    F: Fn(&PhaseTransition) + Send + Sync,
{
    fn on_transition(&self, transition: &PhaseTransition) {
        self(transition)
    }
}

/// Handle returned by [`PhaseMachine::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Applied {
    Unchanged(Phase),
    Transition(PhaseTransition),
}

struct MachineCore {
    phase: Phase,
    previous: Phase,
    session: Option<CallSession>,
    retired: VecDeque<SessionId>,
    mailbox: Mailbox,
    dedup: DedupCache,
    history: VecDeque<TransitionRecord>,
    recovery: Option<JoinHandle<()>>,
}

impl MachineCore {
    fn retire(&mut self, id: SessionId) {
        if self.retired.len() >= RETIRED_ID_LIMIT {
            self.retired.pop_front();
        }
        self.retired.push_back(id);
    }

    fn active_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.session_id.clone())
    }
}

struct Inner {
    me: Weak<Inner>,
    config: PhaseMachineConfig,
    table: TransitionTable,
    core: Mutex<MachineCore>,
    wakeup: Arc<Notify>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn PhaseListener>)>>,
    phase_tx: watch::Sender<Phase>,
    sequence: AtomicU64,
    next_listener: AtomicU64,
}

/// Validated, serialized call lifecycle
#[derive(Clone)]
pub struct PhaseMachine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PhaseMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("PhaseMachine")
            .field("phase", &core.phase)
            .field("session", &core.active_id())
            .field("pending", &core.mailbox.len())
            .finish()
    }
}

impl PhaseMachine {
    /// Create a machine with the standard table. Must be called within a Tokio runtime.
    pub fn new(config: PhaseMachineConfig) -> Self {
        Self::with_table(config, TransitionTable::standard())
    }

    /// Create a machine driven by a custom table
    pub fn with_table(config: PhaseMachineConfig, table: TransitionTable) -> Self {
        let wakeup = Arc::new(Notify::new());
        let (phase_tx, _) = watch::channel(Phase::Idle);

        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            core: Mutex::new(MachineCore {
                phase: Phase::Idle,
                previous: Phase::Idle,
                session: None,
                retired: VecDeque::new(),
                mailbox: Mailbox::new(config.mailbox_capacity),
                dedup: DedupCache::new(config.dedup_window),
                history: VecDeque::with_capacity(config.history_limit),
                recovery: None,
            }),
            config,
            table,
            wakeup: wakeup.clone(),
            listeners: RwLock::new(Vec::new()),
            phase_tx,
            sequence: AtomicU64::new(0),
            next_listener: AtomicU64::new(0),
        });

        tokio::spawn(drain_loop(Arc::downgrade(&inner), wakeup));

        Self { inner }
    }

    /// Admit an event into the mailbox and return a receiver for its outcome
    ///
    /// Duplicates resolve immediately with the current phase.
    pub fn enqueue(&self, event: PhaseEvent) -> oneshot::Receiver<CallResult<Phase>> {
        self.inner.enqueue(event)
    }

    /// Enqueue an event and wait for it to be applied
    pub async fn handle_event(&self, event: PhaseEvent) -> CallResult<Phase> {
        match self.enqueue(event).await {
            Ok(result) => result,
            Err(_) => Err(CallError::internal("phase machine stopped")),
        }
    }

    /// Return to `Idle` immediately, clearing all session state
    pub async fn reset(&self) -> CallResult<Phase> {
        self.handle_event(PhaseEvent::Reset { reason: ResetReason::Explicit }).await
    }

    pub fn phase(&self) -> Phase {
        self.inner.core.lock().phase
    }

    pub fn previous_phase(&self) -> Phase {
        self.inner.core.lock().previous
    }

    /// Snapshot of the active session
    pub fn session(&self) -> Option<CallSession> {
        self.inner.core.lock().session.clone()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.core.lock().active_id()
    }

    /// True if `id` belonged to a session that has since been re-keyed or cleared
    pub fn is_retired(&self, id: &SessionId) -> bool {
        self.inner.core.lock().retired.contains(id)
    }

    /// Most recent transitions, oldest first
    pub fn history(&self) -> Vec<TransitionRecord> {
        self.inner.core.lock().history.iter().cloned().collect()
    }

    pub fn pending_events(&self) -> usize {
        self.inner.core.lock().mailbox.len()
    }

    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.inner.phase_tx.subscribe()
    }

    /// Wait until the machine reaches `phase`
    pub async fn wait_for(&self, phase: Phase) -> CallResult<()> {
        let mut rx = self.watch_phase();
        rx.wait_for(|p| *p == phase)
            .await
            .map(|_| ())
            .map_err(|_| CallError::internal("phase machine stopped"))
    }

    pub fn table(&self) -> &TransitionTable {
        &self.inner.table
    }

    pub fn config(&self) -> &PhaseMachineConfig {
        &self.inner.config
    }

    pub fn subscribe(&self, listener: Arc<dyn PhaseListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}

impl Inner {
    fn enqueue(&self, event: PhaseEvent) -> oneshot::Receiver<CallResult<Phase>> {
        let (tx, rx) = oneshot::channel();
        let kind = event.kind();
        let mut core = self.core.lock();
        let now = Instant::now();

        if core.dedup.is_duplicate(&event, now) {
            debug!(event = ?kind, phase = ?core.phase, "Duplicate event suppressed");
            let _ = tx.send(Ok(core.phase));
            return rx;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let pending = PendingEvent::new(event.clone(), sequence, tx);
        let admitted = match core.mailbox.push(pending) {
            Admission::Queued => true,
            Admission::Evicted(evicted) => {
                warn!(
                    evicted = ?evicted.event.kind(),
                    incoming = ?kind,
                    "Mailbox full, evicting lowest-priority event"
                );
                let evicted_kind = evicted.event.kind();
                evicted.resolve(Err(CallError::EventDiscarded {
                    event: evicted_kind,
                    reason: "evicted from full mailbox".to_string(),
                }));
                true
            }
            Admission::Refused(refused) => {
                warn!(event = ?kind, "Mailbox full, refusing event");
                refused.resolve(Err(CallError::EventDiscarded {
                    event: kind,
                    reason: "mailbox full".to_string(),
                }));
                false
            }
        };

        if admitted {
            core.dedup.record(&event, now);
            trace!(event = ?kind, sequence, pending = core.mailbox.len(), "Event enqueued");
        }
        drop(core);

        if admitted {
            self.wakeup.notify_one();
        }
        rx
    }

    /// Apply the next queued event. Returns false when the mailbox is empty.
    fn process_next(&self) -> bool {
        let mut core = self.core.lock();
        let Some(pending) = core.mailbox.pop() else {
            return false;
        };

        let kind = pending.event.kind();
        if kind != EventKind::Reset && pending.enqueued_at.elapsed() >= self.config.stale_after {
            drop(core);
            warn!(
                event = ?kind,
                age_ms = pending.enqueued_at.elapsed().as_millis() as u64,
                "Discarding stale event"
            );
            pending.resolve(Err(CallError::EventDiscarded {
                event: kind,
                reason: "stale".to_string(),
            }));
            return true;
        }

        let outcome = self.apply(&mut core, &pending.event);
        drop(core);

        match outcome {
            Ok(Applied::Unchanged(phase)) => {
                debug!(event = ?kind, phase = ?phase, "Event accepted without phase change");
                pending.resolve(Ok(phase));
            }
            Ok(Applied::Transition(transition)) => {
                self.publish(&transition);
                pending.resolve(Ok(transition.phase));
            }
            Err(e) => {
                warn!(event = ?kind, error = %e, category = e.category(), "Event rejected");
                pending.resolve(Err(e));
            }
        }
        true
    }

    fn apply(&self, core: &mut MachineCore, event: &PhaseEvent) -> CallResult<Applied> {
        let kind = event.kind();
        let phase = core.phase;

        if self.table.is_noop(phase, kind) {
            return Ok(Applied::Unchanged(phase));
        }
        let next = self
            .table
            .next(phase, kind)
            .ok_or(CallError::InvalidTransition { phase, event: kind })?;
        self.check_reference(core, event)?;

        let now = Utc::now();
        let mut superseded_id = None;
        match event {
            PhaseEvent::StartCall { session_id, remote, call_kind } => {
                core.session = Some(CallSession::outgoing(session_id.clone(), remote, *call_kind));
            }
            PhaseEvent::CallRequestReceived { session_id, remote, call_kind } => {
                core.session = Some(CallSession::incoming(session_id.clone(), remote, *call_kind));
            }
            PhaseEvent::CallAccepted { session_id } => {
                superseded_id = core
                    .session
                    .as_mut()
                    .and_then(|s| s.adopt_authoritative_id(session_id.clone()));
            }
            _ => {}
        }
        if let Some(retired) = &superseded_id {
            core.retire(retired.clone());
        }

        core.previous = phase;
        core.phase = next;
        if let Some(session) = core.session.as_mut() {
            session.previous_phase = phase;
            session.current_phase = next;
            if next == Phase::Connected && session.connected_at.is_none() {
                session.connected_at = Some(now);
            }
            if (next.is_terminal() || next == Phase::Idle) && session.ended_at.is_none() {
                session.ended_at = Some(now);
            }
        }

        let snapshot = core.session.clone();
        if next == Phase::Idle {
            if let Some(cleared) = core.session.take() {
                core.retire(cleared.session_id);
            }
            core.dedup.clear();
        }

        if let Some(timer) = core.recovery.take() {
            timer.abort();
        }
        if next.is_terminal() {
            core.recovery = Some(self.schedule_recovery());
        }

        let record = TransitionRecord {
            from: phase,
            to: next,
            event: kind,
            session_id: snapshot.as_ref().map(|s| s.session_id.clone()),
            at: now,
        };
        if self.config.history_limit > 0 {
            if core.history.len() >= self.config.history_limit {
                core.history.pop_front();
            }
            core.history.push_back(record);
        }

        info!(
            from = ?phase,
            to = ?next,
            event = ?kind,
            session_id = ?snapshot.as_ref().map(|s| s.session_id.as_str()),
            "Phase transition"
        );

        Ok(Applied::Transition(PhaseTransition {
            phase: next,
            previous: phase,
            session: snapshot,
            metadata: TransitionMetadata {
                event: event.clone(),
                at: now,
                superseded_id,
            },
        }))
    }

    fn check_reference(&self, core: &MachineCore, event: &PhaseEvent) -> CallResult<()> {
        let Some(received) = event.session_ref() else {
            return Ok(());
        };

        if core.retired.contains(received) {
            return Err(CallError::StaleReference {
                active: core.active_id(),
                received: received.clone(),
            });
        }
        if event.creates_session() {
            return Ok(());
        }

        match &core.session {
            // Until the transport assigns the real id, any reference is the current call
            Some(session) if session.is_temporary() || session.session_id == *received => Ok(()),
            Some(session) => Err(CallError::StaleReference {
                active: Some(session.session_id.clone()),
                received: received.clone(),
            }),
            None => Ok(()),
        }
    }

    fn schedule_recovery(&self) -> JoinHandle<()> {
        let me = self.me.clone();
        let grace = self.config.terminal_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = me.upgrade() {
                debug!(grace_ms = grace.as_millis() as u64, "Terminal grace elapsed, auto-resetting");
                drop(inner.enqueue(PhaseEvent::Reset { reason: ResetReason::AutoRecovery }));
            }
        })
    }

    fn publish(&self, transition: &PhaseTransition) {
        let listeners: Vec<Arc<dyn PhaseListener>> =
            self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener.on_transition(transition);
        }
        self.phase_tx.send_replace(transition.phase);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        if let Some(timer) = core.recovery.take() {
            timer.abort();
        }
        for pending in core.mailbox.drain() {
            let kind = pending.event.kind();
            pending.resolve(Err(CallError::EventDiscarded {
                event: kind,
                reason: "phase machine dropped".to_string(),
            }));
        }
        // Wake the drain task so it notices the machine is gone
        self.wakeup.notify_one();
    }
}

async fn drain_loop(inner: Weak<Inner>, wakeup: Arc<Notify>) {
    loop {
        let processed = match inner.upgrade() {
            Some(inner) => inner.process_next(),
            None => break,
        };

        if processed {
            tokio::task::yield_now().await;
        } else {
            wakeup.notified().await;
        }
    }
    trace!("Phase machine drain loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaFailureKind;
    use crate::session::{CallKind, RemoteParty};

    fn start(id: &str) -> PhaseEvent {
        PhaseEvent::StartCall {
            session_id: SessionId::from(id),
            remote: RemoteParty::new("T1", "Dr. X"),
            call_kind: CallKind::Voice,
        }
    }

    fn request(id: &str) -> PhaseEvent {
        PhaseEvent::CallRequestReceived {
            session_id: SessionId::from(id),
            remote: RemoteParty::new("P1", "Pat"),
            call_kind: CallKind::Voice,
        }
    }

    fn accepted(id: &str) -> PhaseEvent {
        PhaseEvent::CallAccepted { session_id: SessionId::from(id) }
    }

    fn ended(id: &str) -> PhaseEvent {
        PhaseEvent::CallEnded { session_id: Some(SessionId::from(id)), reason: None }
    }

    async fn drive(machine: &PhaseMachine, events: Vec<PhaseEvent>) -> Phase {
        let mut phase = machine.phase();
        for event in events {
            phase = machine.handle_event(event).await.expect("event should apply");
        }
        phase
    }

    fn path_to(phase: Phase) -> Vec<PhaseEvent> {
        let acquired = PhaseEvent::MediaAcquired { session_id: SessionId::from("tmp-1") };
        let established = PhaseEvent::NegotiationEstablished { session_id: None };
        match phase {
            Phase::Idle => vec![],
            Phase::Initiating => vec![start("tmp-1")],
            Phase::Calling => vec![start("tmp-1"), acquired],
            Phase::Ringing => vec![request("s-1")],
            Phase::Connecting => vec![request("s-1"), PhaseEvent::AcceptCall { session_id: "s-1".into() }],
            Phase::Connected => {
                let mut events = path_to(Phase::Connecting);
                events.push(established);
                events
            }
            Phase::Disconnecting => {
                let mut events = path_to(Phase::Connected);
                events.push(PhaseEvent::EndCall);
                events
            }
            Phase::Ended => {
                let mut events = path_to(Phase::Disconnecting);
                events.push(ended("s-1"));
                events
            }
            Phase::Failed => vec![
                start("tmp-1"),
                PhaseEvent::MediaFailed {
                    session_id: None,
                    kind: MediaFailureKind::PermissionDenied,
                    reason: "denied".into(),
                },
            ],
            Phase::Rejected => vec![
                request("s-1"),
                PhaseEvent::RejectCall { session_id: "s-1".into(), reason: None },
            ],
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(Phase, Phase)>>,
    }

    impl PhaseListener for Recorder {
        fn on_transition(&self, transition: &PhaseTransition) {
            self.seen.lock().push((transition.previous, transition.phase));
        }
    }

    #[tokio::test]
    async fn test_events_outside_table_leave_phase_unchanged() {
        let machine = PhaseMachine::new(PhaseMachineConfig::default());
        drive(&machine, path_to(Phase::Calling)).await;

        let result = machine.handle_event(PhaseEvent::AcceptCall { session_id: "tmp-1".into() }).await;
        assert_eq!(
            result,
            Err(CallError::InvalidTransition { phase: Phase::Calling, event: EventKind::AcceptCall })
        );
        assert_eq!(machine.phase(), Phase::Calling);
        assert!(machine.session().is_some());
    }

    #[tokio::test]
    async fn test_reset_from_every_phase() {
        for phase in Phase::ALL {
            let machine = PhaseMachine::new(PhaseMachineConfig::default());
            assert_eq!(drive(&machine, path_to(phase)).await, phase);

            assert_eq!(machine.reset().await, Ok(Phase::Idle), "reset from {:?}", phase);
            assert_eq!(machine.phase(), Phase::Idle);
            assert!(machine.session().is_none());
        }
    }

    #[tokio::test]
    async fn test_start_outside_idle_does_not_touch_session() {
        let machine = PhaseMachine::new(PhaseMachineConfig::default());
        drive(&machine, path_to(Phase::Ringing)).await;
        let before = machine.session();

        let result = machine.handle_event(start("tmp-2")).await;
        assert!(matches!(result, Err(CallError::InvalidTransition { phase: Phase::Ringing, .. })));
        assert_eq!(machine.session(), before);
    }

    #[tokio::test]
    async fn test_identical_accepts_apply_once() {
        let machine = PhaseMachine::new(PhaseMachineConfig::default());
        drive(&machine, path_to(Phase::Calling)).await;
        let recorder = Arc::new(Recorder::default());
        machine.subscribe(recorder.clone());

        let first = machine.enqueue(accepted("srv-9"));
        let second = machine.enqueue(accepted("srv-9"));

        assert_eq!(second.await.ok(), Some(Ok(Phase::Calling)));
        assert_eq!(first.await.ok(), Some(Ok(Phase::Connecting)));
        assert_eq!(recorder.seen.lock().as_slice(), &[(Phase::Calling, Phase::Connecting)]);
        assert_eq!(machine.session_id(), Some(SessionId::from("srv-9")));
    }

    #[tokio::test]
    async fn test_hangup_beats_pending_accept() {
        let machine = PhaseMachine::new(PhaseMachineConfig::default());
        drive(&machine, path_to(Phase::Ringing)).await;

        let accept = machine.enqueue(PhaseEvent::AcceptCall { session_id: "s-1".into() });
        let hangup = machine.enqueue(ended("s-1"));

        assert_eq!(hangup.await.ok(), Some(Ok(Phase::Ended)));
        assert_eq!(
            accept.await.ok(),
            Some(Err(CallError::InvalidTransition { phase: Phase::Ended, event: EventKind::AcceptCall }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_phase_recovers_within_grace() {
        let machine = PhaseMachine::new(PhaseMachineConfig::default());
        assert_eq!(drive(&machine, path_to(Phase::Rejected)).await, Phase::Rejected);

        tokio::time::timeout(Duration::from_millis(1500), machine.wait_for(Phase::Idle))
            .await
            .expect("auto-reset within grace")
            .expect("machine alive");
        assert!(machine.session().is_none());

        let last = machine.history().pop().expect("history entry");
        assert_eq!((last.from, last.to, last.event), (Phase::Rejected, Phase::Idle, EventKind::Reset));
    }

    #[tokio::test]
    async fn test_stale_and_retired_references() {
        let machine = PhaseMachine::new(PhaseMachineConfig::default());
        drive(&machine, path_to(Phase::Calling)).await;
        drive(&machine, vec![accepted("srv-1")]).await;
        assert!(machine.is_retired(&SessionId::from("tmp-1")));

        // The placeholder id is retired after the upgrade
        let stale = machine
            .handle_event(PhaseEvent::NegotiationEstablished { session_id: Some("tmp-1".into()) })
            .await;
        assert!(matches!(stale, Err(CallError::StaleReference { .. })));

        // A foreign id does not match the authoritative one
        let foreign = machine.handle_event(ended("srv-2")).await;
        assert!(matches!(foreign, Err(CallError::StaleReference { .. })));
        assert_eq!(machine.phase(), Phase::Connecting);

        drive(&machine, vec![ended("srv-1"), PhaseEvent::Reset { reason: ResetReason::Explicit }]).await;
        // A late duplicate request for the finished call is stale
        let late = machine.handle_event(request("srv-1")).await;
        assert!(matches!(late, Err(CallError::StaleReference { .. })));
        assert_eq!(machine.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_echoed_accept_id_rejects_foreign_references() {
        let machine = PhaseMachine::new(PhaseMachineConfig::default());
        drive(&machine, path_to(Phase::Calling)).await;
        drive(&machine, vec![accepted("tmp-1")]).await;

        let session = machine.session().expect("live session");
        assert_eq!(session.session_id, SessionId::from("tmp-1"));
        assert!(!session.is_temporary());
        assert!(!machine.is_retired(&SessionId::from("tmp-1")));

        let foreign = machine.handle_event(ended("srv-someone-else")).await;
        assert!(matches!(foreign, Err(CallError::StaleReference { .. })));
        assert_eq!(machine.phase(), Phase::Connecting);

        assert_eq!(machine.handle_event(ended("tmp-1")).await, Ok(Phase::Ended));
    }

    #[tokio::test]
    async fn test_documented_noops() {
        let machine = PhaseMachine::new(PhaseMachineConfig::default());
        let recorder = Arc::new(Recorder::default());
        machine.subscribe(recorder.clone());

        assert_eq!(machine.reset().await, Ok(Phase::Idle));
        drive(&machine, path_to(Phase::Connecting)).await;
        let started = machine.handle_event(PhaseEvent::NegotiationStarted { session_id: None }).await;
        assert_eq!(started, Ok(Phase::Connecting));

        assert_eq!(
            recorder.seen.lock().as_slice(),
            &[(Phase::Idle, Phase::Ringing), (Phase::Ringing, Phase::Connecting)]
        );
    }

    #[tokio::test]
    async fn test_stale_events_are_discarded_except_reset() {
        let config = PhaseMachineConfig::default().with_stale_after(Duration::ZERO);
        let machine = PhaseMachine::new(config);

        let result = machine.handle_event(start("tmp-1")).await;
        assert!(matches!(result, Err(CallError::EventDiscarded { event: EventKind::StartCall, .. })));
        assert_eq!(machine.reset().await, Ok(Phase::Idle));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_notifications() {
        let machine = PhaseMachine::new(PhaseMachineConfig::default());
        let recorder = Arc::new(Recorder::default());
        let id = machine.subscribe(recorder.clone());
        assert!(machine.unsubscribe(id));
        assert!(!machine.unsubscribe(id));

        drive(&machine, path_to(Phase::Ringing)).await;
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_idle_snapshot_carries_cleared_session() {
        let machine = PhaseMachine::new(PhaseMachineConfig::default());
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = snapshots.clone();
        machine.subscribe(Arc::new(move |t: &PhaseTransition| {
            sink.lock().push((t.phase, t.session_id().cloned()));
        }));

        drive(&machine, path_to(Phase::Calling)).await;
        drive(&machine, vec![PhaseEvent::EndCall]).await;

        let last = snapshots.lock().last().cloned();
        assert_eq!(last, Some((Phase::Idle, Some(SessionId::from("tmp-1")))));
        assert!(machine.session().is_none());
    }
}
