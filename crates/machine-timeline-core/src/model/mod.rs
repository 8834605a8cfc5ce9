//! Domain records shared by the analysis and storage layers.

mod fact;
mod mode;
mod modification;
mod status;

pub use fact::{AutoSequence, Fact};
pub use mode::{MachineMode, ModeCatalog, ModeCategory};
pub use modification::{
    Modification, ModificationCursor, ModificationKind, ModificationQueue, ModificationScope,
    ModificationStatus, NewModification, QueuedModification, DEFAULT_PRIORITY,
};
pub use status::{MachineStatus, ProductionState, ReasonSource};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: i64,
    pub name: String,
}
