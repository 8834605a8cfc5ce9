use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use super::AnalysisContext;
use crate::accumulator::Accumulator;
use crate::consolidation::{needs_processing, Consolidation};
use crate::error::{AnalysisError, ErrorContext, Result};
use crate::model::MachineStatus;
use crate::storage::Database;
use crate::timeline::{
    ObservationAttrs, OperationAttrs, Partition, ReasonAttrs, SlotChange, TimeRange,
};

/// In-memory timeline of one machine.
///
/// Only the tail of the history is loaded up front; older slots are read
/// from storage when an operation reaches back past [`loaded_from`].
///
/// [`loaded_from`]: MachineTimeline::loaded_from
#[derive(Debug, Clone)]
pub struct MachineTimeline {
    pub machine_id: i64,
    pub observation: Partition<ObservationAttrs>,
    pub reasons: Partition<ReasonAttrs>,
    pub operations: Partition<OperationAttrs>,
    pub watermark: Option<DateTime<Utc>>,
    pub auto_sequence_watermark: Option<DateTime<Utc>>,
    loaded_from: Option<DateTime<Utc>>,
}

fn inconsistent(machine_id: i64) -> impl Fn(String) -> AnalysisError {
    move |message| {
        AnalysisError::invariant(
            ErrorContext::machine(machine_id),
            format!("stored slots are inconsistent: {message}"),
        )
    }
}

impl MachineTimeline {
    pub fn empty(machine_id: i64) -> Self {
        Self {
            machine_id,
            observation: Partition::new(),
            reasons: Partition::new(),
            operations: Partition::new(),
            watermark: None,
            auto_sequence_watermark: None,
            loaded_from: None,
        }
    }

    /// Load the slots ending within `lookback` of the older watermark.
    /// Without a watermark nothing was analysed yet and everything is loaded.
    pub fn load(db: &Database, machine_id: i64, lookback: Duration) -> Result<Self> {
        let watermark = db.watermark(machine_id)?;
        let auto_sequence_watermark = db.auto_sequence_watermark(machine_id)?;
        let loaded_from = watermark.map(|watermark| {
            auto_sequence_watermark.map_or(watermark, |auto| auto.min(watermark)) - lookback
        });
        let corrupted = inconsistent(machine_id);
        let timeline = Self {
            machine_id,
            observation: Partition::from_slots(db.load_slots_ending(machine_id, loaded_from, None)?)
                .map_err(&corrupted)?,
            reasons: Partition::from_slots(db.load_slots_ending(machine_id, loaded_from, None)?)
                .map_err(&corrupted)?,
            operations: Partition::from_slots(db.load_slots_ending(machine_id, loaded_from, None)?)
                .map_err(&corrupted)?,
            watermark,
            auto_sequence_watermark,
            loaded_from,
        };
        debug!(
            machine_id,
            loaded_from = ?loaded_from,
            reasons = timeline.reasons.len(),
            "timeline loaded"
        );
        Ok(timeline)
    }

    /// Slots ending before this time are only in storage; `None` when the
    /// whole history is in memory.
    pub fn loaded_from(&self) -> Option<DateTime<Utc>> {
        self.loaded_from
    }

    /// Make sure every slot reaching `at` is in memory, together with the
    /// reason slot touching the earliest of them, so consolidation around
    /// `at` sees both neighbors.
    pub fn ensure_loaded(&mut self, db: &Database, at: DateTime<Utc>) -> Result<()> {
        self.load_back_to(db, at)?;
        if let Some(first) = self.reasons.first().map(|slot| slot.range.begin) {
            self.load_back_to(db, first)?;
        }
        Ok(())
    }

    fn load_back_to(&mut self, db: &Database, from: DateTime<Utc>) -> Result<()> {
        let Some(loaded_from) = self.loaded_from else {
            return Ok(());
        };
        if from >= loaded_from {
            return Ok(());
        }
        let machine_id = self.machine_id;
        let corrupted = inconsistent(machine_id);
        let (from, before) = (Some(from), Some(loaded_from));
        self.observation
            .load_history(db.load_slots_ending(machine_id, from, before)?)
            .map_err(&corrupted)?;
        self.reasons
            .load_history(db.load_slots_ending(machine_id, from, before)?)
            .map_err(&corrupted)?;
        self.operations
            .load_history(db.load_slots_ending(machine_id, from, before)?)
            .map_err(&corrupted)?;
        self.loaded_from = from;
        debug!(machine_id, loaded_from = ?from, "older slots loaded");
        Ok(())
    }
}

/// Changes made by the current unit of work, not yet committed.
#[derive(Debug, Default, Clone)]
pub struct TimelineChanges {
    pub observation: Vec<SlotChange<ObservationAttrs>>,
    pub reasons: Vec<SlotChange<ReasonAttrs>>,
    pub operations: Vec<SlotChange<OperationAttrs>>,
    /// Watermark before the first change of the unit.
    pub previous_watermark: Option<Option<DateTime<Utc>>>,
    pub previous_auto_sequence_watermark: Option<Option<DateTime<Utc>>>,
}

impl TimelineChanges {
    pub fn is_empty(&self) -> bool {
        self.observation.is_empty()
            && self.reasons.is_empty()
            && self.operations.is_empty()
            && self.previous_watermark.is_none()
            && self.previous_auto_sequence_watermark.is_none()
    }
}

/// Analysis state of one machine.
pub struct MachineAnalysis {
    pub(super) machine_id: i64,
    pub(super) context: Arc<AnalysisContext>,
    pub(super) timeline: MachineTimeline,
    pub(super) journal: TimelineChanges,
    extension_failures: usize,
}

impl MachineAnalysis {
    pub fn load(db: &Database, machine_id: i64, context: Arc<AnalysisContext>) -> Result<Self> {
        let timeline = MachineTimeline::load(db, machine_id, context.max_modification_span())?;
        Ok(Self::new(timeline, context))
    }

    pub fn new(timeline: MachineTimeline, context: Arc<AnalysisContext>) -> Self {
        Self {
            machine_id: timeline.machine_id,
            context,
            timeline,
            journal: TimelineChanges::default(),
            extension_failures: 0,
        }
    }

    pub fn machine_id(&self) -> i64 {
        self.machine_id
    }

    pub fn timeline(&self) -> &MachineTimeline {
        &self.timeline
    }

    pub fn journal(&self) -> &TimelineChanges {
        &self.journal
    }

    /// Extension failures seen since the analysis was loaded.
    pub fn extension_failures(&self) -> usize {
        self.extension_failures
    }

    pub(super) fn error_context(&self) -> ErrorContext {
        ErrorContext::machine(self.machine_id)
    }

    pub(super) fn set_watermark(&mut self, watermark: Option<DateTime<Utc>>) {
        if watermark == self.timeline.watermark {
            return;
        }
        if self.journal.previous_watermark.is_none() {
            self.journal.previous_watermark = Some(self.timeline.watermark);
        }
        self.timeline.watermark = watermark;
    }

    pub(super) fn set_auto_sequence_watermark(&mut self, watermark: Option<DateTime<Utc>>) {
        if watermark == self.timeline.auto_sequence_watermark {
            return;
        }
        if self.journal.previous_auto_sequence_watermark.is_none() {
            self.journal.previous_auto_sequence_watermark =
                Some(self.timeline.auto_sequence_watermark);
        }
        self.timeline.auto_sequence_watermark = watermark;
    }

    /// Consolidate the reason slots around `range` at the current watermark.
    pub(super) fn consolidate_range(&mut self, range: &TimeRange) {
        let context = Arc::clone(&self.context);
        let consolidation = context.consolidator().consolidate_range(
            self.machine_id,
            &mut self.timeline.reasons,
            range,
            self.timeline.watermark,
        );
        self.absorb(consolidation);
    }

    pub(super) fn absorb(&mut self, consolidation: Consolidation) {
        for slot in &consolidation.failures {
            let error = AnalysisError::ExtensionDecisionFailure {
                context: self.error_context().with_range(Some(slot.range)),
                extension: slot.failure.extension.clone(),
                message: slot.failure.error.to_string(),
            };
            warn!(
                machine_id = self.machine_id,
                error = %error,
                "reason slot left for reconsolidation"
            );
            self.extension_failures += 1;
        }
        self.journal.reasons.extend(consolidation.changes);
    }

    /// Consolidate up to `analysis.reason_slot_step` slots flagged for
    /// reconsolidation or whose consolidation limit has been reached.
    /// The slots are looked up in storage, so the journal must be empty.
    /// Returns the number of slots processed.
    pub fn process_reason_slots(&mut self, db: &Database) -> Result<usize> {
        let data_end = self.timeline.watermark;
        let pending = db.reason_slots_to_process(
            self.machine_id,
            data_end,
            self.context.analysis.reason_slot_step,
        )?;
        let Some(first) = pending.first() else {
            return Ok(0);
        };
        self.timeline.ensure_loaded(db, first.begin)?;

        let reasons = &self.timeline.reasons;
        let keys: Vec<DateTime<Utc>> = pending
            .iter()
            .map(|range| range.begin)
            .filter(|begin| {
                reasons
                    .get(*begin)
                    .is_some_and(|slot| needs_processing(&slot.attrs, data_end))
            })
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let context = Arc::clone(&self.context);
        let consolidation = context.consolidator().consolidate_keys(
            self.machine_id,
            &mut self.timeline.reasons,
            &keys,
            data_end,
        );
        self.absorb(consolidation);
        debug!(machine_id = self.machine_id, slots = keys.len(), "reason slots processed");
        Ok(keys.len())
    }

    /// Current status derived from the last reason slot.
    pub fn status(&self) -> MachineStatus {
        let now = Utc::now();
        let Some(tail) = self.timeline.reasons.last() else {
            return MachineStatus::empty(self.machine_id, now);
        };

        let mut auto_reason_number = 0;
        let mut expected_end = tail.range.end;
        for slot in self.timeline.reasons.iter().rev() {
            if slot.range.end != expected_end || !slot.attrs.outcome.source.auto {
                break;
            }
            auto_reason_number += 1;
            expected_end = Some(slot.range.begin);
        }

        let input = &tail.attrs.input;
        let outcome = &tail.attrs.outcome;
        MachineStatus {
            machine_id: self.machine_id,
            mode_id: Some(input.mode_id),
            observation_state: input.observation_state.clone(),
            shift: input.shift.clone(),
            machine_state_template: self
                .timeline
                .observation
                .at(tail.range.begin)
                .and_then(|slot| slot.attrs.machine_state_template.clone()),
            reason: outcome.reason.clone(),
            reason_source: outcome.source,
            reason_score: outcome.score,
            auto_reason_number,
            reason_slot_end: tail.range.end,
            consolidation_limit: outcome.consolidation_limit,
            updated_at: now,
        }
    }

    /// Write the machine status.
    pub fn refresh_status(&mut self, db: &Database) -> Result<MachineStatus> {
        let status = self.status();
        db.upsert_machine_status(&status)?;
        Ok(status)
    }

    /// Write the journal: slots, summary deltas and watermarks. Must run in
    /// the transaction of the unit of work.
    pub fn persist(&self, db: &Database) -> Result<()> {
        if self.journal.is_empty() {
            return Ok(());
        }
        db.apply_slot_changes(self.machine_id, &self.journal.observation)?;
        db.apply_slot_changes(self.machine_id, &self.journal.reasons)?;
        db.apply_slot_changes(self.machine_id, &self.journal.operations)?;

        let mut accumulator = Accumulator::new(self.machine_id, self.context.cutoff);
        accumulator.record_reason_changes(&self.journal.reasons);
        for (key, delta) in accumulator.take() {
            let totals = db.apply_summary_delta(&key, delta)?;
            if totals.duration_secs < 0 || totals.number < 0 {
                return Err(AnalysisError::invariant(
                    self.error_context(),
                    format!(
                        "summary {key:?} would become negative ({}s, {})",
                        totals.duration_secs, totals.number
                    ),
                )
                .into());
            }
        }

        if self.journal.previous_watermark.is_some() {
            db.set_watermark(self.machine_id, self.timeline.watermark)?;
        }
        if self.journal.previous_auto_sequence_watermark.is_some() {
            db.set_auto_sequence_watermark(self.machine_id, self.timeline.auto_sequence_watermark)?;
        }
        Ok(())
    }

    /// Forget the journal once its transaction committed.
    pub fn commit(&mut self) {
        self.journal = TimelineChanges::default();
    }

    /// Undo the journaled changes on the in-memory timeline.
    pub fn rollback(&mut self) {
        let journal = std::mem::take(&mut self.journal);
        self.timeline.observation.revert(&journal.observation);
        self.timeline.reasons.revert(&journal.reasons);
        self.timeline.operations.revert(&journal.operations);
        if let Some(watermark) = journal.previous_watermark {
            self.timeline.watermark = watermark;
        }
        if let Some(watermark) = journal.previous_auto_sequence_watermark {
            self.timeline.auto_sequence_watermark = watermark;
        }
    }
}
