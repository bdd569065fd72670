//! Per-operation timeout budgets
//!
//! Timers are cancellable handles owned by the governor. Expiry has exactly one
//! effect: a `Timeout` event enqueued into the phase machine.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::phase::{PhaseEvent, PhaseMachine, TimeoutKind};
use crate::session::SessionId;

pub(crate) struct TimeoutGovernor {
    machine: PhaseMachine,
    timers: Mutex<HashMap<TimeoutKind, JoinHandle<()>>>,
}

impl TimeoutGovernor {
    pub(crate) fn new(machine: PhaseMachine) -> Self {
        Self {
            machine,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) the budget for `kind`
    pub(crate) fn arm(&self, kind: TimeoutKind, after: Duration, session_id: Option<SessionId>) {
        let machine = self.machine.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            warn!(
                operation = %kind,
                after_ms = after.as_millis() as u64,
                session_id = ?session_id.as_ref().map(|id| id.as_str()),
                "Operation timed out"
            );
            drop(machine.enqueue(PhaseEvent::Timeout {
                session_id,
                operation: kind,
                after_ms: after.as_millis() as u64,
            }));
        });

        if let Some(previous) = self.timers.lock().insert(kind, timer) {
            previous.abort();
        }
        debug!(operation = %kind, after_ms = after.as_millis() as u64, "Timeout armed");
    }

    pub(crate) fn clear(&self, kind: TimeoutKind) {
        if let Some(timer) = self.timers.lock().remove(&kind) {
            timer.abort();
            debug!(operation = %kind, "Timeout cleared");
        }
    }

    pub(crate) fn clear_all(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self, kind: TimeoutKind) -> bool {
        self.timers
            .lock()
            .get(&kind)
            .is_some_and(|timer| !timer.is_finished())
    }
}

impl Drop for TimeoutGovernor {
    fn drop(&mut self) {
        for (_, timer) in self.timers.get_mut().drain() {
            timer.abort();
        }
    }
}
