//! Machine modes reported by controllers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeCategory {
    Inactive,
    Active,
    Stopped,
    Error,
    Unknown,
}

impl ModeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModeCategory::Inactive => "inactive",
            ModeCategory::Active => "active",
            ModeCategory::Stopped => "stopped",
            ModeCategory::Error => "error",
            ModeCategory::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "inactive" => ModeCategory::Inactive,
            "active" => ModeCategory::Active,
            "stopped" => ModeCategory::Stopped,
            "error" => ModeCategory::Error,
            _ => ModeCategory::Unknown,
        }
    }
}

/// Catalog entry for a machine mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineMode {
    pub id: i64,
    pub name: String,
    pub category: ModeCategory,
    /// Counts as running time for operation slots.
    pub running: bool,
    /// Periods in this mode may carry an auto-sequence.
    pub auto_sequence: bool,
}

impl MachineMode {
    pub fn unknown(id: i64) -> Self {
        Self {
            id,
            name: format!("mode-{id}"),
            category: ModeCategory::Unknown,
            running: false,
            auto_sequence: false,
        }
    }
}

/// Modes indexed by id. Lookups of unregistered ids fall back to an
/// unknown, non-running mode.
#[derive(Debug, Clone, Default)]
pub struct ModeCatalog {
    modes: HashMap<i64, MachineMode>,
}

impl ModeCatalog {
    pub fn new(modes: impl IntoIterator<Item = MachineMode>) -> Self {
        Self {
            modes: modes.into_iter().map(|mode| (mode.id, mode)).collect(),
        }
    }

    /// The catalog seeded in a fresh database.
    pub fn builtin() -> Self {
        let mode = |id, name: &str, category, running, auto_sequence| MachineMode {
            id,
            name: name.to_string(),
            category,
            running,
            auto_sequence,
        };
        Self::new([
            mode(1, "Inactive", ModeCategory::Inactive, false, false),
            mode(2, "Active", ModeCategory::Active, true, true),
            mode(3, "ManualActive", ModeCategory::Active, true, false),
            mode(4, "Stopped", ModeCategory::Stopped, false, false),
            mode(5, "Error", ModeCategory::Error, false, false),
            mode(6, "Unknown", ModeCategory::Unknown, false, false),
        ])
    }

    pub fn get(&self, id: i64) -> MachineMode {
        self.modes
            .get(&id)
            .cloned()
            .unwrap_or_else(|| MachineMode::unknown(id))
    }

    pub fn is_running(&self, id: i64) -> bool {
        self.modes.get(&id).map_or(false, |mode| mode.running)
    }

    pub fn supports_auto_sequence(&self, id: i64) -> bool {
        self.modes.get(&id).map_or(false, |mode| mode.auto_sequence)
    }

    /// Modes sorted by id.
    pub fn iter(&self) -> impl Iterator<Item = &MachineMode> + '_ {
        let mut modes: Vec<&MachineMode> = self.modes.values().collect();
        modes.sort_by_key(|mode| mode.id);
        modes.into_iter()
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}
