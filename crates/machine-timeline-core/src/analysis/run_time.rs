//! Operation run-times.

use chrono::Duration;

use crate::model::{Fact, ModeCatalog};
use crate::storage::Database;
use crate::timeline::{OperationAttrs, Partition, SlotChange, TimeRange};

/// Seconds of `range` covered by facts in a running mode. Open ranges have
/// no run-time yet.
pub fn run_time(range: &TimeRange, facts: &[Fact], modes: &ModeCatalog) -> Option<i64> {
    range.end?;
    let total = facts
        .iter()
        .filter(|fact| modes.is_running(fact.mode_id))
        .filter_map(|fact| fact.range.intersection(range))
        .filter_map(|part| part.duration())
        .fold(Duration::zero(), |acc, d| acc + d);
    Some(total.num_seconds())
}

/// Recompute the run-time of the operation slots overlapping `range`.
pub(crate) fn refresh_run_times(
    db: &Database,
    machine_id: i64,
    modes: &ModeCatalog,
    operations: &mut Partition<OperationAttrs>,
    range: &TimeRange,
) -> Result<Vec<SlotChange<OperationAttrs>>, rusqlite::Error> {
    let targets: Vec<_> = operations
        .overlapping(range)
        .into_iter()
        .map(|slot| (slot.range, slot.attrs.clone()))
        .collect();

    let mut changes = Vec::new();
    for (slot_range, attrs) in targets {
        let facts = db.facts_overlapping(machine_id, &slot_range)?;
        let run_time_secs = run_time(&slot_range, &facts, modes);
        if run_time_secs == attrs.run_time_secs {
            continue;
        }
        let updated = OperationAttrs {
            run_time_secs,
            ..attrs
        };
        changes.extend(operations.replace_attributes(slot_range.begin, updated));
    }
    Ok(changes)
}
