//! Admission-time duplicate suppression

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use tokio::time::Instant;

use super::types::{EventKind, PhaseEvent};

/// Remembers recently admitted events by `(kind, payload)` hash
#[derive(Debug)]
pub(crate) struct DedupCache {
    window: Duration,
    seen: HashMap<u64, Instant>,
}

impl DedupCache {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    fn key(event: &PhaseEvent) -> u64 {
        let mut hasher = DefaultHasher::new();
        event.kind().hash(&mut hasher);
        event.hash(&mut hasher);
        hasher.finish()
    }

    /// True if an identical event was admitted within the window
    pub(crate) fn is_duplicate(&mut self, event: &PhaseEvent, now: Instant) -> bool {
        if event.kind() == EventKind::Reset || self.window.is_zero() {
            return false;
        }

        let window = self.window;
        self.seen.retain(|_, at| now.duration_since(*at) < window);
        self.seen.contains_key(&Self::key(event))
    }

    /// Mark `event` as admitted at `now`
    pub(crate) fn record(&mut self, event: &PhaseEvent, now: Instant) {
        if event.kind() != EventKind::Reset {
            self.seen.insert(Self::key(event), now);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::types::ResetReason;
    use crate::session::SessionId;

    #[tokio::test]
    async fn test_identical_events_within_window() {
        let mut cache = DedupCache::new(Duration::from_millis(500));
        let now = Instant::now();
        let accepted = PhaseEvent::CallAccepted { session_id: SessionId::from("srv-1") };

        assert!(!cache.is_duplicate(&accepted, now));
        cache.record(&accepted, now);
        assert!(cache.is_duplicate(&accepted, now + Duration::from_millis(100)));
        assert!(!cache.is_duplicate(&accepted, now + Duration::from_millis(600)));
    }

    #[tokio::test]
    async fn test_payload_distinguishes_events() {
        let mut cache = DedupCache::new(Duration::from_millis(500));
        let now = Instant::now();
        let a = PhaseEvent::CallAccepted { session_id: SessionId::from("srv-1") };
        let b = PhaseEvent::CallAccepted { session_id: SessionId::from("srv-2") };

        cache.record(&a, now);
        assert!(!cache.is_duplicate(&b, now));
        assert!(cache.is_duplicate(&a, now));
    }

    #[tokio::test]
    async fn test_reset_is_never_deduplicated() {
        let mut cache = DedupCache::new(Duration::from_millis(500));
        let now = Instant::now();
        let reset = PhaseEvent::Reset { reason: ResetReason::Explicit };

        cache.record(&reset, now);
        assert!(!cache.is_duplicate(&reset, now));
    }
}
