//! Modifications: units of pending change consumed by the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::timeline::TimeRange;

/// Priority given to modifications created without an explicit one.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Modification status.
///
/// ```text
///   Pending ──> InProgress ──> Done
///                   │  │
///                   │  └────> Error
///                   v
///       PendingSubModifications ──> Done (once every child is Done)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationStatus {
    Pending,
    InProgress,
    PendingSubModifications,
    Done,
    Error,
}

impl ModificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModificationStatus::Pending => "pending",
            ModificationStatus::InProgress => "in_progress",
            ModificationStatus::PendingSubModifications => "pending_sub_modifications",
            ModificationStatus::Done => "done",
            ModificationStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ModificationStatus::Pending),
            "in_progress" => Some(ModificationStatus::InProgress),
            "pending_sub_modifications" => Some(ModificationStatus::PendingSubModifications),
            "done" => Some(ModificationStatus::Done),
            "error" => Some(ModificationStatus::Error),
            _ => None,
        }
    }

    /// Check if a transition is valid. `Error → Pending` is the operator retry.
    pub fn can_transition_to(&self, to: ModificationStatus) -> bool {
        use ModificationStatus::*;
        match self {
            Pending => matches!(to, InProgress),
            InProgress => matches!(to, InProgress | Done | Error | PendingSubModifications),
            PendingSubModifications => matches!(to, Done | Error),
            Done => false,
            Error => matches!(to, Pending),
        }
    }
}

impl fmt::Display for ModificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationScope {
    Global,
    Machine(i64),
}

impl ModificationScope {
    pub fn machine_id(&self) -> Option<i64> {
        match self {
            ModificationScope::Global => None,
            ModificationScope::Machine(id) => Some(*id),
        }
    }
}

fn default_manual_score() -> f64 {
    100.0
}

/// What a modification changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModificationKind {
    /// Assign an observation state (and optionally a shift) to a period.
    ObservationState {
        range: TimeRange,
        observation_state: String,
        #[serde(default)]
        shift: Option<String>,
        #[serde(default)]
        machine_state_template: Option<String>,
    },
    /// Enter a manual reason; `None` goes back to the default reason.
    Reason {
        range: TimeRange,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default = "default_manual_score")]
        score: f64,
    },
    /// Declare the operation machined during a period.
    Operation {
        range: TimeRange,
        operation: String,
        #[serde(default)]
        work_order: Option<String>,
    },
    /// Change the shift of a period.
    Shift {
        range: TimeRange,
        #[serde(default)]
        shift: Option<String>,
    },
    /// Recompute reasons of a period, e.g. after a configuration change.
    Reconsolidate { range: TimeRange },
}

impl ModificationKind {
    pub fn range(&self) -> &TimeRange {
        match self {
            ModificationKind::ObservationState { range, .. }
            | ModificationKind::Reason { range, .. }
            | ModificationKind::Operation { range, .. }
            | ModificationKind::Shift { range, .. }
            | ModificationKind::Reconsolidate { range } => range,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModificationKind::ObservationState { .. } => "observation_state",
            ModificationKind::Reason { .. } => "reason",
            ModificationKind::Operation { .. } => "operation",
            ModificationKind::Shift { .. } => "shift",
            ModificationKind::Reconsolidate { .. } => "reconsolidate",
        }
    }

    /// Same change restricted to `range`.
    pub fn with_range(&self, range: TimeRange) -> Self {
        let mut kind = self.clone();
        match &mut kind {
            ModificationKind::ObservationState { range: r, .. }
            | ModificationKind::Reason { range: r, .. }
            | ModificationKind::Operation { range: r, .. }
            | ModificationKind::Shift { range: r, .. }
            | ModificationKind::Reconsolidate { range: r } => *r = range,
        }
        kind
    }

    /// Kinds that may be issued globally and are fanned out per machine.
    pub fn applies_globally(&self) -> bool {
        matches!(
            self,
            ModificationKind::Shift { .. } | ModificationKind::Reconsolidate { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub id: i64,
    pub scope: ModificationScope,
    pub parent_id: Option<i64>,
    pub priority: i32,
    pub status: ModificationStatus,
    pub kind: ModificationKind,
    /// Children spawned while processing, in processing order.
    pub children: Vec<i64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A modification to be appended to the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewModification {
    pub scope: ModificationScope,
    pub parent_id: Option<i64>,
    pub priority: i32,
    pub kind: ModificationKind,
    pub created_at: DateTime<Utc>,
}

impl NewModification {
    pub fn for_machine(machine_id: i64, kind: ModificationKind) -> Self {
        Self {
            scope: ModificationScope::Machine(machine_id),
            parent_id: None,
            priority: DEFAULT_PRIORITY,
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn global(kind: ModificationKind) -> Self {
        Self {
            scope: ModificationScope::Global,
            parent_id: None,
            priority: DEFAULT_PRIORITY,
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn child_of(mut self, parent: &Modification) -> Self {
        self.parent_id = Some(parent.id);
        self
    }
}

/// Queue a modification is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModificationQueue {
    Global,
    Machine(i64),
}

/// Position in the `(priority desc, id asc)` order.
///
/// A modification is after the cursor when its priority is lower, or equal
/// with a greater id. The starting cursor admits everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModificationCursor {
    pub after_priority: i32,
    pub after_id: i64,
}

impl ModificationCursor {
    pub fn start() -> Self {
        Self {
            after_priority: i32::MAX,
            after_id: 0,
        }
    }

    pub fn admits(&self, priority: i32, id: i64) -> bool {
        priority < self.after_priority || (priority == self.after_priority && id > self.after_id)
    }

    pub fn advance(&mut self, queued: &QueuedModification) {
        self.after_priority = queued.effective_priority;
        self.after_id = queued.modification.id;
    }
}

impl Default for ModificationCursor {
    fn default() -> Self {
        Self::start()
    }
}

/// A modification drawn from a queue, with the priority it was ordered by.
///
/// A parent waiting on children is ordered by the highest priority among
/// its unfinished children.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedModification {
    pub modification: Modification,
    pub effective_priority: i32,
}
