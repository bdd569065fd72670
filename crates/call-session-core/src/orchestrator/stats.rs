use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::phase::{EventKind, Phase, PhaseTransition};

/// Call counters since the orchestrator was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStats {
    pub calls_started: u64,
    pub calls_received: u64,
    pub calls_connected: u64,
    pub calls_failed: u64,
    pub calls_rejected: u64,
    pub calls_ended: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    started: AtomicU64,
    received: AtomicU64,
    connected: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    ended: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record(&self, transition: &PhaseTransition) {
        let counter = match (transition.previous, transition.phase) {
            (Phase::Idle, Phase::Initiating) => &self.started,
            (Phase::Idle, Phase::Ringing) => &self.received,
            (_, Phase::Connected) => &self.connected,
            (_, Phase::Failed) => &self.failed,
            (_, Phase::Rejected) => &self.rejected,
            (_, Phase::Ended) => &self.ended,
            // Hang-up before the remote party ever answered
            (previous, Phase::Idle)
                if !previous.is_terminal() && transition.metadata.event.kind() == EventKind::EndCall =>
            {
                &self.ended
            }
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CallStats {
        CallStats {
            calls_started: self.started.load(Ordering::Relaxed),
            calls_received: self.received.load(Ordering::Relaxed),
            calls_connected: self.connected.load(Ordering::Relaxed),
            calls_failed: self.failed.load(Ordering::Relaxed),
            calls_rejected: self.rejected.load(Ordering::Relaxed),
            calls_ended: self.ended.load(Ordering::Relaxed),
        }
    }
}
