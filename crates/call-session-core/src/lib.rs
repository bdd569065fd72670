//! Call-session-core: single voice call session coordination
//!
//! This crate sequences one voice call between two parties over an external
//! signaling channel and a peer-to-peer media engine. It owns the lifecycle
//! of the call and leaves transport and audio to the embedding application.
//!
//! ## Layers
//! ```text
//! application -> CallOrchestrator -> {PhaseMachine, NegotiationGuard, RetryPolicy}
//!                       |                                |
//!               SignalingChannel                    MediaEngine
//! ```
//!
//! - [`phase`]: the authoritative transition table, a priority mailbox with
//!   deduplication and automatic recovery from terminal phases
//! - [`negotiation`]: SDP offer/answer and ICE candidate sequencing, including
//!   glare handling and early candidate queueing
//! - [`orchestrator`]: local intents, remote notification handlers, phase-entry
//!   side effects and per-operation timeouts
//! - [`recovery`]: exponential backoff behind a circuit breaker
//!
//! Signaling and media are trait objects ([`SignalingChannel`], [`MediaEngine`])
//! so the core can be driven by any transport or audio stack, and by fakes in
//! tests.

pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod orchestrator;
pub mod phase;
pub mod recovery;
pub mod session;
pub mod signaling;

pub use error::{CallError, CallResult, MediaFailureKind};
pub use events::{CallEvent, EventPriority};
pub use media::{
    IceCandidate, IceConnectionState, MediaEngine, MediaStream, PeerConnection, PeerConnectionEvent,
    PeerConnectionState, SdpKind, SessionDescription,
};
pub use negotiation::{NegotiationContext, NegotiationGuard};
pub use orchestrator::{CallOrchestrator, CallStats, OrchestratorBuilder, OrchestratorConfig};
pub use phase::{
    EventKind, Phase, PhaseEvent, PhaseListener, PhaseMachine, PhaseMachineConfig, PhaseTransition,
    ResetReason, TimeoutKind, TransitionTable,
};
pub use recovery::{CircuitBreakerConfig, RetryConfig, RetryPolicy, RetryPolicyState};
pub use session::{CallKind, CallRole, CallSession, IdProvenance, LocalParty, RemoteParty, SessionId};
pub use signaling::{SignalingChannel, SignalingMessage, SignalingNotification};

/// Call-session-core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
