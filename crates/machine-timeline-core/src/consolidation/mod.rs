//! Reason consolidation.
//!
//! The outcome of a reason slot is computed from the slot inputs, the
//! inputs of its touching neighbors and the data end (the analysis
//! watermark). Nothing else is read, so whatever the order in which slots
//! were edited, consolidating the final partition gives the same result.
//!
//! Decision order:
//!
//! 1. the registered extensions propose a default reason; when none does
//!    the slot is `Unanswered`;
//! 2. a non-running slot shorter than the grace period is `Short` instead.
//!    While its end reaches the data end it may still grow, so it carries a
//!    consolidation limit at `begin + grace` and is consolidated again once
//!    the data passes that limit;
//! 3. a manual reason overrides whatever was decided.

mod default_reason;
mod extension;

pub use default_reason::{default_rules, DefaultReasonExtension, DefaultReasonRule};
pub use extension::{
    Decision, DecisionContext, DecisionFailure, ExtensionError, ExtensionRegistry, Proposal,
    ReasonExtension,
};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::model::{ModeCatalog, ProductionState, ReasonSource};
use crate::timeline::{Partition, ReasonAttrs, ReasonOutcome, Slot, SlotChange, TimeRange};

/// Reason of a non-running slot shorter than the grace period.
pub const SHORT_REASON: &str = "Short";
/// Reason of a slot no extension has a proposal for.
pub const UNANSWERED_REASON: &str = "Unanswered";

/// An extension failure on one slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotFailure {
    pub range: TimeRange,
    pub failure: DecisionFailure,
}

/// Result of consolidating a set of slots.
#[derive(Debug, Default)]
pub struct Consolidation {
    pub changes: Vec<SlotChange<ReasonAttrs>>,
    pub failures: Vec<SlotFailure>,
}

impl Consolidation {
    pub fn extend(&mut self, other: Consolidation) {
        self.changes.extend(other.changes);
        self.failures.extend(other.failures);
    }
}

pub struct Consolidator<'a> {
    registry: &'a ExtensionRegistry,
    modes: &'a ModeCatalog,
    short_period: Duration,
}

impl<'a> Consolidator<'a> {
    pub fn new(
        registry: &'a ExtensionRegistry,
        modes: &'a ModeCatalog,
        short_period: Duration,
    ) -> Self {
        Self {
            registry,
            modes,
            short_period,
        }
    }

    /// Outcome of `slot` given its neighbors and the data end.
    pub fn outcome(
        &self,
        machine_id: i64,
        slot: &Slot<ReasonAttrs>,
        previous: Option<&Slot<ReasonAttrs>>,
        next: Option<&Slot<ReasonAttrs>>,
        data_end: Option<DateTime<Utc>>,
    ) -> Result<ReasonOutcome, DecisionFailure> {
        let input = &slot.attrs.input;
        let mode = self.modes.get(input.mode_id);
        let ctx = DecisionContext {
            machine_id,
            range: &slot.range,
            mode: &mode,
            input,
            previous: previous.map(|s| &s.attrs.input),
            next: next.map(|s| &s.attrs.input),
        };

        let mut outcome = match self.registry.decide(&ctx)? {
            Some(decision) => ReasonOutcome {
                reason: Some(decision.proposal.reason),
                source: if decision.proposal.auto {
                    ReasonSource::AUTO
                } else {
                    ReasonSource::DEFAULT
                },
                score: decision.proposal.score,
                production_state: decision.proposal.production_state,
                default_reason: true,
                consolidation_limit: None,
                needs_reconsolidation: false,
            },
            None => unanswered(),
        };

        if !mode.running {
            if let Some(limit) = self.short_limit(&slot.range, data_end) {
                outcome = short(limit);
            }
        }

        if let Some(manual) = &input.manual {
            let default_is_auto = if outcome.source.auto {
                ReasonSource::DEFAULT_IS_AUTO
            } else {
                ReasonSource::default()
            };
            outcome = ReasonOutcome {
                reason: Some(manual.reason.clone()),
                source: ReasonSource::MANUAL.union(default_is_auto),
                score: manual.score,
                production_state: outcome.production_state,
                default_reason: false,
                consolidation_limit: None,
                needs_reconsolidation: false,
            };
        }

        Ok(outcome)
    }

    /// `Some(limit)` when the slot is short; the inner value is the limit
    /// of a slot that may still grow.
    fn short_limit(
        &self,
        range: &TimeRange,
        data_end: Option<DateTime<Utc>>,
    ) -> Option<Option<DateTime<Utc>>> {
        let extendable = match (range.end, data_end) {
            (None, _) => true,
            (Some(end), Some(data_end)) => end >= data_end,
            (Some(_), None) => false,
        };
        let observed = match (range.end, data_end) {
            (Some(end), _) => end - range.begin,
            (None, Some(data_end)) if data_end > range.begin => data_end - range.begin,
            (None, _) => Duration::zero(),
        };
        if observed >= self.short_period {
            return None;
        }
        Some(extendable.then(|| range.begin + self.short_period))
    }

    /// Consolidate the slots overlapping `range` and their touching neighbors.
    pub fn consolidate_range(
        &self,
        machine_id: i64,
        partition: &mut Partition<ReasonAttrs>,
        range: &TimeRange,
        data_end: Option<DateTime<Utc>>,
    ) -> Consolidation {
        let keys = partition.keys_around(range);
        self.consolidate_keys(machine_id, partition, &keys, data_end)
    }

    /// Consolidate the slots starting at `keys`.
    pub fn consolidate_keys(
        &self,
        machine_id: i64,
        partition: &mut Partition<ReasonAttrs>,
        keys: &[DateTime<Utc>],
        data_end: Option<DateTime<Utc>>,
    ) -> Consolidation {
        let mut result = Consolidation::default();
        if keys.is_empty() {
            return result;
        }
        self.registry.start_batch();
        for key in keys {
            let Some(slot) = partition.get(*key) else {
                continue;
            };
            let previous = partition.previous(slot.range.begin);
            let next = partition.next(slot);
            let attrs = match self.outcome(machine_id, slot, previous, next, data_end) {
                Ok(outcome) => ReasonAttrs {
                    input: slot.attrs.input.clone(),
                    outcome,
                },
                Err(failure) => {
                    result.failures.push(SlotFailure {
                        range: slot.range,
                        failure,
                    });
                    let mut attrs = slot.attrs.clone();
                    attrs.outcome.needs_reconsolidation = true;
                    attrs
                }
            };
            let changes = partition.replace_attributes(*key, attrs);
            if !changes.is_empty() {
                debug!(machine_id, slot = %key, "reason slot consolidated");
            }
            result.changes.extend(changes);
        }
        self.registry.end_batch();
        result
    }
}

/// Whether a slot must go through consolidation again at `data_end`.
pub fn needs_processing(attrs: &ReasonAttrs, data_end: Option<DateTime<Utc>>) -> bool {
    if attrs.outcome.needs_reconsolidation {
        return true;
    }
    match (attrs.outcome.consolidation_limit, data_end) {
        (Some(limit), Some(data_end)) => limit <= data_end,
        _ => false,
    }
}

fn unanswered() -> ReasonOutcome {
    ReasonOutcome {
        reason: Some(UNANSWERED_REASON.to_string()),
        source: ReasonSource::DEFAULT,
        score: 0.0,
        production_state: ProductionState::NoProduction,
        default_reason: true,
        consolidation_limit: None,
        needs_reconsolidation: false,
    }
}

fn short(limit: Option<DateTime<Utc>>) -> ReasonOutcome {
    ReasonOutcome {
        reason: Some(SHORT_REASON.to_string()),
        source: ReasonSource::DEFAULT,
        score: 0.0,
        production_state: ProductionState::NoProduction,
        default_reason: true,
        consolidation_limit: limit,
        needs_reconsolidation: false,
    }
}
