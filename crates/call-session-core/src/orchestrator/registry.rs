//! Arena of live session handles, keyed by session id

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::negotiation::NegotiationGuard;
use crate::session::{CallRole, SessionId};

/// Resources owned for one session
#[derive(Debug)]
pub struct SessionHandle {
    pub generation: u64,
    pub role: CallRole,
    pub guard: Arc<NegotiationGuard>,
    pub created_at: DateTime<Utc>,
}

/// Insert on creation, re-key when the id is upgraded, remove on return to `Idle`
#[derive(Debug, Default)]
pub struct SessionRegistry {
    handles: DashMap<SessionId, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: SessionId, handle: Arc<SessionHandle>) -> Option<Arc<SessionHandle>> {
        debug!(session_id = %id, generation = handle.generation, "Session handle registered");
        self.handles.insert(id, handle)
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.handles.get(id).map(|entry| entry.value().clone())
    }

    /// Move the handle from `old` to `new`
    pub fn rekey(&self, old: &SessionId, new: SessionId) -> bool {
        match self.handles.remove(old) {
            Some((_, handle)) => {
                debug!(old = %old, new = %new, "Session handle re-keyed");
                self.handles.insert(new, handle);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.handles.remove(id).map(|(_, handle)| handle)
    }

    /// Find the handle for a generation, with its current id
    pub fn find_by_generation(&self, generation: u64) -> Option<(SessionId, Arc<SessionHandle>)> {
        self.handles
            .iter()
            .find(|entry| entry.value().generation == generation)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Remove everything, returning the handles so their resources can be released
    pub fn drain(&self) -> Vec<Arc<SessionHandle>> {
        let ids: Vec<SessionId> = self.handles.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }
}
