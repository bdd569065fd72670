//! SDP offer/answer and ICE candidate sequencing for one session

pub mod context;
pub mod guard;

pub use context::NegotiationContext;
pub use guard::{
    CandidateOutcome, GuardEvent, GuardNotification, NegotiationGuard, NegotiationHealth,
    OfferOutcome, RemoteAnswerOutcome, RemoteOfferOutcome, MAX_QUEUED_REMOTE_CANDIDATES,
};
