//! The transition table: pure data mapping `(phase, event) -> next phase`

use std::collections::{HashMap, HashSet};

use super::types::{EventKind, Phase};

/// Phase x event -> phase lookup, plus the documented idempotent no-ops
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    transitions: HashMap<(Phase, EventKind), Phase>,
    noops: HashSet<(Phase, EventKind)>,
}

impl TransitionTable {
    /// The call lifecycle table
    pub fn standard() -> Self {
        let mut builder = TransitionTableBuilder::new();
        builder
            // Idle
            .add(Phase::Idle, EventKind::StartCall, Phase::Initiating)
            .add(Phase::Idle, EventKind::CallRequestReceived, Phase::Ringing)
            // Initiating
            .add(Phase::Initiating, EventKind::MediaAcquired, Phase::Calling)
            .add(Phase::Initiating, EventKind::MediaFailed, Phase::Failed)
            .add(Phase::Initiating, EventKind::EndCall, Phase::Idle)
            // Calling
            .add(Phase::Calling, EventKind::CallAccepted, Phase::Connecting)
            .add(Phase::Calling, EventKind::CallRejected, Phase::Rejected)
            .add(Phase::Calling, EventKind::ConnectionFailed, Phase::Failed)
            .add(Phase::Calling, EventKind::Timeout, Phase::Failed)
            .add(Phase::Calling, EventKind::EndCall, Phase::Idle)
            // Ringing
            .add(Phase::Ringing, EventKind::AcceptCall, Phase::Connecting)
            .add(Phase::Ringing, EventKind::RejectCall, Phase::Rejected)
            .add(Phase::Ringing, EventKind::CallCancelled, Phase::Ended)
            .add(Phase::Ringing, EventKind::CallEnded, Phase::Ended)
            .add(Phase::Ringing, EventKind::Timeout, Phase::Failed)
            // Connecting
            .add(Phase::Connecting, EventKind::NegotiationEstablished, Phase::Connected)
            .add(Phase::Connecting, EventKind::NegotiationFailed, Phase::Failed)
            .add(Phase::Connecting, EventKind::ConnectionFailed, Phase::Failed)
            .add(Phase::Connecting, EventKind::Timeout, Phase::Failed)
            .add(Phase::Connecting, EventKind::EndCall, Phase::Disconnecting)
            .add(Phase::Connecting, EventKind::CallEnded, Phase::Ended)
            .noop(Phase::Connecting, EventKind::NegotiationStarted)
            // Connected
            .add(Phase::Connected, EventKind::EndCall, Phase::Disconnecting)
            .add(Phase::Connected, EventKind::CallEnded, Phase::Ended)
            .add(Phase::Connected, EventKind::NegotiationLost, Phase::Disconnecting)
            .add(Phase::Connected, EventKind::NegotiationFailed, Phase::Failed)
            .add(Phase::Connected, EventKind::ConnectionFailed, Phase::Failed)
            // Disconnecting
            .add(Phase::Disconnecting, EventKind::CallEnded, Phase::Ended)
            // Reset is the universal escape hatch
            .add_wildcard(EventKind::Reset, Phase::Idle)
            .noop(Phase::Idle, EventKind::Reset);
        builder.build()
    }

    /// Next phase for `event` in `phase`, if the table allows it
    pub fn next(&self, phase: Phase, event: EventKind) -> Option<Phase> {
        self.transitions.get(&(phase, event)).copied()
    }

    /// True for the documented events that succeed without changing phase
    pub fn is_noop(&self, phase: Phase, event: EventKind) -> bool {
        self.noops.contains(&(phase, event))
    }

    pub fn accepts(&self, phase: Phase, event: EventKind) -> bool {
        self.is_noop(phase, event) || self.next(phase, event).is_some()
    }

    /// Events accepted in `phase` (no-ops included)
    pub fn accepted_events(&self, phase: Phase) -> Vec<EventKind> {
        EventKind::ALL
            .iter()
            .copied()
            .filter(|event| self.accepts(phase, *event))
            .collect()
    }

    /// Check the table for structural mistakes
    ///
    /// - every phase must accept `Reset`, leading to `Idle`
    /// - terminal phases must accept nothing but `Reset`
    /// - every non-terminal phase other than `Idle` needs an exit besides `Reset`
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for phase in Phase::ALL {
            if phase != Phase::Idle && self.next(phase, EventKind::Reset) != Some(Phase::Idle) {
                errors.push(format!("Phase {:?} does not reset to Idle", phase));
            }

            let exits: Vec<EventKind> = self
                .accepted_events(phase)
                .into_iter()
                .filter(|e| *e != EventKind::Reset)
                .collect();

            if phase.is_terminal() && !exits.is_empty() {
                errors.push(format!("Terminal phase {:?} accepts {:?}", phase, exits));
            }
            if !phase.is_terminal() && phase != Phase::Idle && exits.is_empty() {
                errors.push(format!("Phase {:?} has no exit transitions", phase));
            }
        }

        for (phase, event) in &self.noops {
            if self.transitions.get(&(*phase, *event)).is_some_and(|next| next != phase) {
                errors.push(format!("No-op {:?} in {:?} also changes phase", event, phase));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Builder for constructing a transition table
pub struct TransitionTableBuilder {
    table: TransitionTable,
}

impl TransitionTableBuilder {
    pub fn new() -> Self {
        Self {
            table: TransitionTable::default(),
        }
    }

    /// Add a simple phase change
    pub fn add(&mut self, from: Phase, event: EventKind, to: Phase) -> &mut Self {
        self.table.transitions.insert((from, event), to);
        self
    }

    /// Add a transition that applies from every phase
    pub fn add_wildcard(&mut self, event: EventKind, to: Phase) -> &mut Self {
        for from in Phase::ALL {
            self.table.transitions.insert((from, event), to);
        }
        self
    }

    /// Mark `event` as an idempotent no-op in `phase`
    pub fn noop(&mut self, phase: Phase, event: EventKind) -> &mut Self {
        self.table.transitions.remove(&(phase, event));
        self.table.noops.insert((phase, event));
        self
    }

    pub fn remove(&mut self, from: Phase, event: EventKind) -> &mut Self {
        self.table.transitions.remove(&(from, event));
        self.table.noops.remove(&(from, event));
        self
    }

    pub fn build(&mut self) -> TransitionTable {
        std::mem::take(&mut self.table)
    }
}

impl Default for TransitionTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}
