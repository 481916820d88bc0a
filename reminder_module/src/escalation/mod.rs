mod ladder;
mod machine;
mod state;
mod store;

pub use ladder::{
    EscalationLadder, EscalationLevel, EscalationRule, LadderError, MAX_ESCALATION_DELAY_SECS,
};
pub use machine::EscalationMachine;
pub use state::{DoseKey, EscalationState, Resolution};
pub use store::{EscalationStore, MemoryEscalationStore, SqliteEscalationStore};
