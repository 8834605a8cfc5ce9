use tracing::info;

use super::machine::MachineAnalysis;
use super::run_time::refresh_run_times;
use crate::error::{AnalysisError, CoreError, Result, ValidationError};
use crate::model::{Modification, ModificationKind, ModificationScope, NewModification};
use crate::scheduler::{ModificationProcessor, Outcome};
use crate::storage::Database;
use crate::timeline::{ManualReason, ObservationAttrs, OperationAttrs, ReasonAttrs, TimeRange};

impl MachineAnalysis {
    /// Apply a modification of this machine to the in-memory timeline.
    ///
    /// A bounded range longer than `analysis.max_modification_span_hours`
    /// is not applied: one child per span-sized chunk is returned instead.
    pub fn apply_modification(
        &mut self,
        db: &Database,
        modification: &Modification,
    ) -> Result<Outcome> {
        let range = *modification.kind.range();
        let context = self
            .error_context()
            .with_modification(modification.id)
            .with_range(Some(range));
        let invalid = |message: String| AnalysisError::modification(context.clone(), message);

        if modification.scope != ModificationScope::Machine(self.machine_id) {
            return Err(invalid(format!(
                "modification targets {:?}, not machine {}",
                modification.scope, self.machine_id
            ))
            .into());
        }
        if !db.machine_exists(self.machine_id)? {
            return Err(invalid(format!("unknown machine {}", self.machine_id)).into());
        }
        range.validate().map_err(|e| invalid(e.to_string()))?;

        let max_span = self.context.max_modification_span();
        if range.duration().map_or(false, |d| d > max_span) {
            let children: Vec<NewModification> = range
                .chunks(max_span)
                .into_iter()
                .map(|chunk| {
                    let kind = modification.kind.with_range(chunk);
                    NewModification::for_machine(self.machine_id, kind)
                        .with_priority(modification.priority)
                        .child_of(modification)
                })
                .collect();
            info!(
                machine_id = self.machine_id,
                modification_id = modification.id,
                children = children.len(),
                "modification split"
            );
            return Ok(Outcome::Spawn(children));
        }

        self.timeline.ensure_loaded(db, range.begin)?;
        self.apply_kind(db, &modification.kind).map_err(|e| match e {
            CoreError::Validation(err) => invalid(err.to_string()).into(),
            other => other,
        })?;
        info!(
            machine_id = self.machine_id,
            modification_id = modification.id,
            kind = modification.kind.name(),
            "modification applied"
        );
        Ok(Outcome::Done)
    }

    fn apply_kind(&mut self, db: &Database, kind: &ModificationKind) -> Result<()> {
        match kind {
            ModificationKind::ObservationState {
                range,
                observation_state,
                shift,
                machine_state_template,
            } => {
                let changes = self.timeline.observation.insert(
                    *range,
                    ObservationAttrs {
                        observation_state: observation_state.clone(),
                        shift: shift.clone(),
                        machine_state_template: machine_state_template.clone(),
                    },
                )?;
                self.journal.observation.extend(changes);
                self.rewrite_reason_inputs(range, |input| {
                    input.observation_state = Some(observation_state.clone());
                    input.shift = shift.clone();
                })?;
                self.consolidate_range(range);
            }
            ModificationKind::Reason {
                range,
                reason,
                score,
            } => {
                let manual = reason.as_ref().map(|reason| ManualReason {
                    reason: reason.clone(),
                    score: *score,
                });
                self.rewrite_reason_inputs(range, |input| input.manual = manual.clone())?;
                self.consolidate_range(range);
            }
            ModificationKind::Operation {
                range,
                operation,
                work_order,
            } => {
                let changes = self.timeline.operations.insert(
                    *range,
                    OperationAttrs {
                        operation: operation.clone(),
                        work_order: work_order.clone(),
                        run_time_secs: None,
                    },
                )?;
                self.journal.operations.extend(changes);
                self.refresh_run_times(db, range)?;
            }
            ModificationKind::Shift { range, shift } => {
                let changes = self.timeline.observation.update(range, |attrs| ObservationAttrs {
                    shift: shift.clone(),
                    ..attrs.clone()
                })?;
                self.journal.observation.extend(changes);
                self.rewrite_reason_inputs(range, |input| input.shift = shift.clone())?;
                self.consolidate_range(range);
            }
            ModificationKind::Reconsolidate { range } => {
                self.consolidate_range(range);
            }
        }
        Ok(())
    }

    /// Rewrite the inputs of the reason slots covered by `range`. Rewritten
    /// slots lose their outcome until consolidated again.
    pub(super) fn rewrite_reason_inputs<F>(
        &mut self,
        range: &TimeRange,
        mut rewrite: F,
    ) -> std::result::Result<(), ValidationError>
    where
        F: FnMut(&mut crate::timeline::ReasonInput),
    {
        let changes = self.timeline.reasons.update(range, |attrs| {
            let mut input = attrs.input.clone();
            rewrite(&mut input);
            if input == attrs.input {
                attrs.clone()
            } else {
                ReasonAttrs::new(input)
            }
        })?;
        self.journal.reasons.extend(changes);
        Ok(())
    }

    pub(super) fn refresh_run_times(&mut self, db: &Database, range: &TimeRange) -> Result<()> {
        let changes = refresh_run_times(
            db,
            self.machine_id,
            &self.context.modes,
            &mut self.timeline.operations,
            range,
        )?;
        self.journal.operations.extend(changes);
        Ok(())
    }
}

impl ModificationProcessor for MachineAnalysis {
    fn apply(&mut self, db: &Database, modification: &Modification) -> Result<Outcome> {
        let outcome = self.apply_modification(db, modification)?;
        self.persist(db)?;
        Ok(outcome)
    }

    fn commit(&mut self) {
        MachineAnalysis::commit(self);
    }

    fn rollback(&mut self) {
        MachineAnalysis::rollback(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisContext, MachineTimeline};
    use crate::model::{Machine, ModeCatalog, ModificationStatus, ReasonSource};
    use crate::storage::Config;
    use crate::timeline::ReasonInput;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 8, h, 0, 0).unwrap()
    }

    fn range(begin: u32, end: u32) -> TimeRange {
        TimeRange::new(t(begin), t(end)).unwrap()
    }

    fn setup() -> (Database, MachineAnalysis) {
        let db = Database::open_memory().unwrap();
        db.upsert_machine(&Machine {
            id: 1,
            name: "press-1".into(),
        })
        .unwrap();
        let context =
            Arc::new(AnalysisContext::new(&Config::default(), ModeCatalog::builtin()).unwrap());
        let mut analysis = MachineAnalysis::new(MachineTimeline::empty(1), context);
        let changes = analysis
            .timeline
            .reasons
            .insert(
                range(8, 12),
                ReasonAttrs::new(ReasonInput {
                    mode_id: 4,
                    observation_state: None,
                    shift: None,
                    auto_sequence: None,
                    manual: None,
                }),
            )
            .unwrap();
        analysis.journal.reasons.extend(changes);
        analysis.set_watermark(Some(t(12)));
        analysis.consolidate_range(&range(8, 12));
        analysis.commit();
        (db, analysis)
    }

    fn modification(id: i64, kind: ModificationKind) -> Modification {
        Modification {
            id,
            scope: ModificationScope::Machine(1),
            parent_id: None,
            priority: 100,
            status: ModificationStatus::InProgress,
            kind,
            children: Vec::new(),
            error: None,
            created_at: t(0),
            updated_at: t(0),
        }
    }

    #[test]
    fn observation_state_splits_reason_slots() {
        let (db, mut analysis) = setup();
        let kind = ModificationKind::ObservationState {
            range: range(9, 10),
            observation_state: "Unemployed".into(),
            shift: Some("morning".into()),
            machine_state_template: None,
        };
        let outcome = analysis.apply_modification(&db, &modification(1, kind)).unwrap();
        assert_eq!(outcome, Outcome::Done);

        let reasons: Vec<_> = analysis
            .timeline()
            .reasons
            .iter()
            .map(|s| s.attrs.outcome.reason.clone().unwrap())
            .collect();
        assert_eq!(reasons, vec!["Stop", "Unemployed", "Stop"]);
        assert_eq!(analysis.timeline().observation.len(), 1);
        let middle = analysis.timeline().reasons.at(t(9)).unwrap();
        assert_eq!(middle.attrs.input.shift.as_deref(), Some("morning"));
    }

    #[test]
    fn manual_reason_overrides_and_resets() {
        let (db, mut analysis) = setup();
        let set = ModificationKind::Reason {
            range: range(8, 12),
            reason: Some("Maintenance".into()),
            score: 100.0,
        };
        analysis.apply_modification(&db, &modification(1, set)).unwrap();
        let slot = analysis.timeline().reasons.first().unwrap();
        assert_eq!(slot.attrs.outcome.reason.as_deref(), Some("Maintenance"));
        assert!(slot.attrs.outcome.source.contains(ReasonSource::MANUAL));

        let reset = ModificationKind::Reason {
            range: range(8, 12),
            reason: None,
            score: 100.0,
        };
        analysis.apply_modification(&db, &modification(2, reset)).unwrap();
        let slot = analysis.timeline().reasons.first().unwrap();
        assert_eq!(slot.attrs.outcome.reason.as_deref(), Some("Stop"));
        assert_eq!(slot.attrs.outcome.source, ReasonSource::DEFAULT);
    }

    #[test]
    fn long_ranges_spawn_children() {
        let (db, mut analysis) = setup();
        let long = TimeRange::new(t(0), t(0) + Duration::hours(60)).unwrap();
        let reconsolidate = modification(7, ModificationKind::Reconsolidate { range: long });
        let outcome = analysis.apply_modification(&db, &reconsolidate).unwrap();
        let Outcome::Spawn(children) = outcome else {
            panic!("expected children");
        };
        assert_eq!(children.len(), 3);
        assert!(children.iter().all(|c| c.parent_id == Some(7)));
        assert_eq!(children[2].kind.range().duration(), Some(Duration::hours(12)));
        assert!(analysis.journal().is_empty());
    }

    #[test]
    fn unknown_machine_is_a_modification_error() {
        let (_, mut analysis) = setup();
        let empty = Database::open_memory().unwrap();
        let err = analysis
            .apply_modification(
                &empty,
                &modification(3, ModificationKind::Reconsolidate { range: range(8, 9) }),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Analysis(AnalysisError::ModificationError { .. })
        ));
    }

    #[test]
    fn operation_gets_run_time() {
        let (db, mut analysis) = setup();
        db.insert_fact(1, &range(8, 10), 2).unwrap();
        let kind = ModificationKind::Operation {
            range: range(9, 11),
            operation: "op-7".into(),
            work_order: Some("wo-1".into()),
        };
        analysis.apply_modification(&db, &modification(1, kind)).unwrap();
        let op = analysis.timeline().operations.first().unwrap();
        assert_eq!(op.attrs.run_time_secs, Some(3600));
    }
}
