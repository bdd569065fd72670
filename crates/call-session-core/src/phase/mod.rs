//! Call lifecycle phases and the machine that sequences them

mod dedup;
mod mailbox;
pub mod machine;
pub mod table;
pub mod types;

pub use machine::{
    ListenerId, PhaseListener, PhaseMachine, PhaseMachineConfig, PhaseTransition,
    TransitionMetadata, TransitionRecord,
};
pub use table::{TransitionTable, TransitionTableBuilder};
pub use types::{EventKind, Phase, PhaseEvent, ResetReason, TimeoutKind};
