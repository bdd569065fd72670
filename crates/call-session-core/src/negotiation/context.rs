//! Per-session SDP/ICE bookkeeping

use std::collections::VecDeque;

use crate::media::IceCandidate;
use crate::session::CallRole;

/// What has been negotiated so far for one session. Never shared between sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationContext {
    role: CallRole,
    pub(crate) has_local_description: bool,
    pub(crate) has_remote_description: bool,
    pub(crate) queued_remote_candidates: VecDeque<IceCandidate>,
    pub(crate) offer_initiated: bool,
}

impl NegotiationContext {
    pub fn new(role: CallRole) -> Self {
        Self {
            role,
            has_local_description: false,
            has_remote_description: false,
            queued_remote_candidates: VecDeque::new(),
            offer_initiated: false,
        }
    }

    /// Fixed at construction; the only authority on who offers
    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn has_local_description(&self) -> bool {
        self.has_local_description
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    pub fn offer_initiated(&self) -> bool {
        self.offer_initiated
    }

    pub fn queued_candidates(&self) -> usize {
        self.queued_remote_candidates.len()
    }

    /// Both descriptions are in place
    pub fn is_stable(&self) -> bool {
        self.has_local_description && self.has_remote_description
    }

    /// A local offer is out and no answer has been applied yet
    pub fn has_pending_local_offer(&self) -> bool {
        self.has_local_description && !self.has_remote_description
    }
}
