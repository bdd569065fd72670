//! Call orchestrator
//!
//! The orchestrator owns call semantics. It turns local intents
//! ([`start_call`](CallOrchestrator::start_call), [`accept_call`](CallOrchestrator::accept_call),
//! [`reject_call`](CallOrchestrator::reject_call), [`end_call`](CallOrchestrator::end_call))
//! and remote notifications into typed [`PhaseEvent`](crate::phase::PhaseEvent)s, runs
//! the side effects of entering each phase and mediates between the phase
//! machine, the negotiation guard, the signaling channel and the media engine.
//!
//! # Architecture Overview
//!
//! - **`calls`** - local intents
//! - **`remote`** - remote notification handlers and `dispatch`
//! - **`effects`** - phase-entry side effects and negotiation guard events
//! - **`timeouts`** - per-operation timeout budgets
//! - **`registry`** - arena of session handles
//!
//! # Usage
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use rvoip_call_session_core::{OrchestratorBuilder, LocalParty, CallKind, CallEvent};
//! # use rvoip_call_session_core::{SignalingChannel, MediaEngine};
//! # async fn example(
//! #     signaling: Arc<dyn SignalingChannel>,
//! #     media: Arc<dyn MediaEngine>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = OrchestratorBuilder::new()
//!     .local_party(LocalParty::new("T1", "Dr. X"))
//!     .signaling(signaling)
//!     .media(media)
//!     .build()?;
//!
//! orchestrator.initialize().await?;
//! let mut events = orchestrator.subscribe_events();
//!
//! let _session_id = orchestrator.start_call("P7", "Pat", CallKind::Voice).await?;
//! while let Ok(event) = events.recv().await {
//!     if let CallEvent::PhaseChanged(transition) = event {
//!         println!("{:?} -> {:?}", transition.previous, transition.phase);
//!     }
//! }
//! orchestrator.end_call().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{CallError, CallResult};
use crate::events::CallEvent;
use crate::media::MediaEngine;
use crate::negotiation::GuardEvent;
use crate::phase::{Phase, PhaseListener, PhaseMachine, PhaseTransition, TransitionRecord};
use crate::recovery::{with_timeout, RetryPolicy, RetryPolicyState};
use crate::session::{CallSession, LocalParty};
use crate::signaling::{SignalingChannel, SignalingMessage, SignalingNotification};

pub mod builder;
pub mod calls;
pub mod config;
mod effects;
pub mod registry;
pub mod remote;
pub mod stats;
mod timeouts;

pub use builder::OrchestratorBuilder;
pub use config::OrchestratorConfig;
pub use registry::{SessionHandle, SessionRegistry};
pub use stats::CallStats;

use stats::StatsCounters;
use timeouts::TimeoutGovernor;

/// Coordinates a single voice call session for one local identity
pub struct CallOrchestrator {
    me: Weak<CallOrchestrator>,
    config: OrchestratorConfig,
    local: LocalParty,
    signaling: Arc<dyn SignalingChannel>,
    media: Arc<dyn MediaEngine>,
    machine: PhaseMachine,
    registry: SessionRegistry,
    timeouts: TimeoutGovernor,
    retry: Arc<RetryPolicy>,
    init_lock: AsyncMutex<()>,
    /// Orders setup requests against hang-up on the wire
    signaling_lock: AsyncMutex<()>,
    initialized: AtomicBool,
    event_tx: broadcast::Sender<CallEvent>,
    guard_tx: mpsc::UnboundedSender<GuardEvent>,
    generation: AtomicU64,
    stats: StatsCounters,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOrchestrator")
            .field("local", &self.local.id)
            .field("machine", &self.machine)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Forwards applied transitions to the orchestrator without keeping it alive
struct TransitionRelay {
    orchestrator: Weak<CallOrchestrator>,
}

impl PhaseListener for TransitionRelay {
    fn on_transition(&self, transition: &PhaseTransition) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator.on_transition(transition);
        }
    }
}

impl CallOrchestrator {
    /// Create an orchestrator. Must be called within a Tokio runtime.
    ///
    /// `retry` is shared process-wide state; pass the same policy to every
    /// orchestrator that should share one circuit breaker.
    pub fn new(
        config: OrchestratorConfig,
        local: LocalParty,
        signaling: Arc<dyn SignalingChannel>,
        media: Arc<dyn MediaEngine>,
        retry: Option<Arc<RetryPolicy>>,
    ) -> Arc<Self> {
        let machine = PhaseMachine::new(config.machine.clone());
        let (event_tx, _) = broadcast::channel(config.event_buffer.max(1));
        let (guard_tx, guard_rx) = mpsc::unbounded_channel();
        let retry = retry.unwrap_or_else(|| {
            Arc::new(RetryPolicy::new(config.retry.clone(), config.circuit_breaker.clone()))
        });

        let orchestrator = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            timeouts: TimeoutGovernor::new(machine.clone()),
            machine,
            config,
            local,
            signaling,
            media,
            registry: SessionRegistry::new(),
            retry,
            init_lock: AsyncMutex::new(()),
            signaling_lock: AsyncMutex::new(()),
            initialized: AtomicBool::new(false),
            event_tx,
            guard_tx,
            generation: AtomicU64::new(0),
            stats: StatsCounters::default(),
            pump: Mutex::new(None),
        });

        orchestrator.machine.subscribe(Arc::new(TransitionRelay {
            orchestrator: Arc::downgrade(&orchestrator),
        }));
        tokio::spawn(relay_guard_events(Arc::downgrade(&orchestrator), guard_rx));

        debug!(local_id = %orchestrator.local.id, "Call orchestrator created");
        orchestrator
    }

    /// Connect signaling and initialize the media engine
    ///
    /// Each step runs through the retry policy, both under one top-level
    /// timeout. On failure partial state is cleaned up and
    /// [`CallError::InitializationFailed`] is returned. Calling it again after
    /// success is a no-op.
    pub async fn initialize(&self) -> CallResult<()> {
        let _init = self.init_lock.lock().await;
        if self.is_initialized() {
            debug!("Call orchestrator already initialized");
            return Ok(());
        }

        info!(local_id = %self.local.id, "Initializing call orchestrator");
        let bootstrap = async {
            self.retry
                .execute("signaling_connect", || self.signaling.connect())
                .await?;
            self.retry
                .execute("media_initialize", || self.media.initialize())
                .await
        };

        match with_timeout("initialize", self.config.initialization_timeout, bootstrap).await {
            Ok(()) => {
                let notifications = self.signaling.subscribe();
                let pump = tokio::spawn(pump_signaling(self.me.clone(), notifications));
                if let Some(previous) = self.pump.lock().replace(pump) {
                    previous.abort();
                }
                self.initialized.store(true, Ordering::Release);
                info!(local_id = %self.local.id, "Call orchestrator initialized");
                Ok(())
            }
            Err(e) => {
                error!(
                    local_id = %self.local.id,
                    error = %e,
                    category = e.category(),
                    "Initialization failed, cleaning up"
                );
                self.signaling.disconnect().await;
                Err(CallError::initialization_failed(e.to_string()))
            }
        }
    }

    /// Reset any active call, stop pumping notifications and disconnect
    pub async fn shutdown(&self) {
        let _init = self.init_lock.lock().await;
        if let Err(e) = self.end_call().await {
            debug!(error = %e, "Hang-up during shutdown failed");
        }
        if let Err(e) = self.machine.reset().await {
            warn!(error = %e, "Reset during shutdown failed");
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        for handle in self.registry.drain() {
            handle.guard.close().await;
        }
        self.timeouts.clear_all();
        if self.initialized.swap(false, Ordering::AcqRel) {
            self.signaling.disconnect().await;
        }
        info!(local_id = %self.local.id, "Call orchestrator shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_initialized(&self) -> CallResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(CallError::NotInitialized)
        }
    }

    pub fn local_party(&self) -> &LocalParty {
        &self.local
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.machine.phase()
    }

    /// Snapshot of the active session
    pub fn session(&self) -> Option<CallSession> {
        self.machine.session()
    }

    pub fn phase_machine(&self) -> &PhaseMachine {
        &self.machine
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.machine.history()
    }

    pub fn watch_phase(&self) -> tokio::sync::watch::Receiver<Phase> {
        self.machine.watch_phase()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn stats(&self) -> CallStats {
        self.stats.snapshot()
    }

    pub fn retry_state(&self) -> RetryPolicyState {
        self.retry.state()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.registry
    }

    pub(crate) fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Send a notification that must never block teardown
    pub(crate) async fn send_best_effort(&self, message: SignalingMessage) {
        let name = message.event_name();
        let sending = self.signaling.send(message);
        if let Err(e) = with_timeout(name, self.config.teardown_timeout, sending).await {
            warn!(message = name, error = %e, "Best-effort signaling failed");
        }
    }
}

impl Drop for CallOrchestrator {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn pump_signaling(
    orchestrator: Weak<CallOrchestrator>,
    mut notifications: broadcast::Receiver<SignalingNotification>,
) {
    loop {
        match notifications.recv().await {
            Ok(notification) => {
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                orchestrator.dispatch(notification).await;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Signaling notifications lagged, some were dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    trace!("Signaling pump stopped");
}

async fn relay_guard_events(
    orchestrator: Weak<CallOrchestrator>,
    mut events: mpsc::UnboundedReceiver<GuardEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        orchestrator.on_guard_event(event).await;
    }
}
