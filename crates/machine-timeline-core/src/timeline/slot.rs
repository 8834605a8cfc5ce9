//! Slot records and the attributes carried by each slot kind.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use super::TimeRange;
use crate::model::{ProductionState, ReasonSource};

/// Attributes stored on a slot.
///
/// `mergeable` decides whether two touching slots collapse into one; by
/// default only identical attributes merge. Kinds with computed fields
/// compare their inputs only and rebuild the computed part in `merged`.
pub trait SlotAttributes: Clone + PartialEq + Debug {
    fn mergeable(&self, other: &Self) -> bool {
        self == other
    }

    fn merged(&self, _right: &Self) -> Self {
        self.clone()
    }
}

/// Persisted slot kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    ObservationState,
    Reason,
    Operation,
}

impl SlotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotKind::ObservationState => "observation_state",
            SlotKind::Reason => "reason",
            SlotKind::Operation => "operation",
        }
    }
}

/// Attributes that can be persisted as one slot kind.
pub trait KindAttributes: SlotAttributes + Serialize + DeserializeOwned {
    const KIND: SlotKind;

    /// Whether the slot waits for reconsolidation, and the time after
    /// which it must be reconsidered. Stored beside the attributes so
    /// pending slots can be found without reading every slot.
    fn processing_marks(&self) -> (bool, Option<DateTime<Utc>>) {
        (false, None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot<A> {
    pub range: TimeRange,
    pub attrs: A,
}

impl<A> Slot<A> {
    pub fn new(range: TimeRange, attrs: A) -> Self {
        Self { range, attrs }
    }

    pub fn begin(&self) -> DateTime<Utc> {
        self.range.begin
    }
}

/// A slot created or destroyed by a partition operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotChange<A> {
    Added(Slot<A>),
    Removed(Slot<A>),
}

impl<A> SlotChange<A> {
    pub fn slot(&self) -> &Slot<A> {
        match self {
            SlotChange::Added(slot) | SlotChange::Removed(slot) => slot,
        }
    }

    /// +1 for an added slot, -1 for a removed one.
    pub fn sign(&self) -> i64 {
        match self {
            SlotChange::Added(_) => 1,
            SlotChange::Removed(_) => -1,
        }
    }
}

/// Observation state assigned by an operator or a shift plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationAttrs {
    pub observation_state: String,
    #[serde(default)]
    pub shift: Option<String>,
    #[serde(default)]
    pub machine_state_template: Option<String>,
}

impl SlotAttributes for ObservationAttrs {}

impl KindAttributes for ObservationAttrs {
    const KIND: SlotKind = SlotKind::ObservationState;
}

/// Reason entered by an operator; overrides extension decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualReason {
    pub reason: String,
    pub score: f64,
}

/// Inputs of a reason slot. Two touching reason slots merge when their
/// inputs are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasonInput {
    pub mode_id: i64,
    #[serde(default)]
    pub observation_state: Option<String>,
    #[serde(default)]
    pub shift: Option<String>,
    #[serde(default)]
    pub auto_sequence: Option<String>,
    #[serde(default)]
    pub manual: Option<ManualReason>,
}

/// Consolidated part of a reason slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasonOutcome {
    pub reason: Option<String>,
    pub source: ReasonSource,
    pub score: f64,
    pub production_state: ProductionState,
    pub default_reason: bool,
    pub consolidation_limit: Option<DateTime<Utc>>,
    pub needs_reconsolidation: bool,
}

impl ReasonOutcome {
    /// Outcome of a slot that was never consolidated.
    pub fn pending() -> Self {
        Self {
            reason: None,
            source: ReasonSource::default(),
            score: 0.0,
            production_state: ProductionState::Unknown,
            default_reason: false,
            consolidation_limit: None,
            needs_reconsolidation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasonAttrs {
    pub input: ReasonInput,
    pub outcome: ReasonOutcome,
}

impl ReasonAttrs {
    pub fn new(input: ReasonInput) -> Self {
        Self {
            input,
            outcome: ReasonOutcome::pending(),
        }
    }
}

impl SlotAttributes for ReasonAttrs {
    fn mergeable(&self, other: &Self) -> bool {
        self.input == other.input
    }

    fn merged(&self, _right: &Self) -> Self {
        ReasonAttrs::new(self.input.clone())
    }
}

impl KindAttributes for ReasonAttrs {
    const KIND: SlotKind = SlotKind::Reason;

    fn processing_marks(&self) -> (bool, Option<DateTime<Utc>>) {
        (
            self.outcome.needs_reconsolidation,
            self.outcome.consolidation_limit,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationAttrs {
    pub operation: String,
    #[serde(default)]
    pub work_order: Option<String>,
    /// Running time inside the slot, in seconds.
    #[serde(default)]
    pub run_time_secs: Option<i64>,
}

impl SlotAttributes for OperationAttrs {
    fn mergeable(&self, other: &Self) -> bool {
        self.operation == other.operation && self.work_order == other.work_order
    }

    fn merged(&self, _right: &Self) -> Self {
        Self {
            run_time_secs: None,
            ..self.clone()
        }
    }
}

impl KindAttributes for OperationAttrs {
    const KIND: SlotKind = SlotKind::Operation;
}
