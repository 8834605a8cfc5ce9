use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::queue::{ModificationProcessor, Outcome};
use crate::analysis::{AnalysisContext, MachineAnalysis};
use crate::error::{AnalysisError, ErrorContext, Result};
use crate::model::{Modification, ModificationScope, NewModification};
use crate::storage::Database;

/// Processor of the Global queue.
///
/// A global modification fans out into one child per machine; the
/// children are applied by per-machine analyses loaded on first use.
pub struct GlobalProcessor {
    context: Arc<AnalysisContext>,
    machines: HashMap<i64, MachineAnalysis>,
    current: Option<i64>,
}

impl GlobalProcessor {
    pub fn new(context: Arc<AnalysisContext>) -> Self {
        Self {
            context,
            machines: HashMap::new(),
            current: None,
        }
    }

    fn fan_out(&self, db: &Database, modification: &Modification) -> Result<Outcome> {
        if !modification.kind.applies_globally() {
            return Err(AnalysisError::modification(
                ErrorContext::machine(0)
                    .with_modification(modification.id)
                    .with_range(Some(*modification.kind.range())),
                format!("{} modifications need a machine", modification.kind.name()),
            )
            .into());
        }
        let children: Vec<NewModification> = db
            .list_machines()?
            .into_iter()
            .map(|machine| {
                NewModification::for_machine(machine.id, modification.kind.clone())
                    .with_priority(modification.priority)
                    .child_of(modification)
            })
            .collect();
        info!(
            modification_id = modification.id,
            machines = children.len(),
            "global modification fanned out"
        );
        Ok(Outcome::Spawn(children))
    }
}

impl ModificationProcessor for GlobalProcessor {
    fn apply(&mut self, db: &Database, modification: &Modification) -> Result<Outcome> {
        match modification.scope {
            ModificationScope::Global => {
                self.current = None;
                self.fan_out(db, modification)
            }
            ModificationScope::Machine(machine_id) => {
                self.current = Some(machine_id);
                let analysis = match self.machines.entry(machine_id) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => entry.insert(MachineAnalysis::load(
                        db,
                        machine_id,
                        Arc::clone(&self.context),
                    )?),
                };
                analysis.apply(db, modification)
            }
        }
    }

    fn commit(&mut self) {
        if let Some(analysis) = self.current.and_then(|id| self.machines.get_mut(&id)) {
            analysis.commit();
        }
    }

    fn rollback(&mut self) {
        if let Some(analysis) = self.current.and_then(|id| self.machines.get_mut(&id)) {
            analysis.rollback();
        }
    }
}
