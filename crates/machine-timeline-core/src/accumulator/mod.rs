//! Incremental per-day summaries.
//!
//! Summaries are never recomputed from the timeline. Every slot change is
//! cut at day boundaries and turned into signed deltas: an added slot adds
//! its duration and one occurrence to each day it touches, a removed slot
//! subtracts them. Deltas are buffered for one unit of work and flushed in
//! the same transaction as the slots.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::timeline::{ReasonAttrs, SlotChange, TimeRange};

/// Time of day at which a summary day starts.
///
/// A cutoff after noon starts the day on the previous calendar day: with
/// `22:00`, the 5th runs from the 4th at 22:00 to the 5th at 22:00.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayCutoff {
    offset: Duration,
}

impl DayCutoff {
    pub fn midnight() -> Self {
        Self {
            offset: Duration::zero(),
        }
    }

    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let time = NaiveTime::parse_from_str(value, "%H:%M").map_err(|e| {
            ConfigError::InvalidValue {
                key: "summary.day_cutoff".to_string(),
                message: format!("{value}: {e}"),
            }
        })?;
        let since_midnight = Duration::seconds(i64::from(time.num_seconds_from_midnight()));
        let offset = if since_midnight > Duration::hours(12) {
            since_midnight - Duration::hours(24)
        } else {
            since_midnight
        };
        Ok(Self { offset })
    }

    pub fn day_of(&self, at: DateTime<Utc>) -> NaiveDate {
        (at - self.offset).date_naive()
    }

    pub fn day_begin(&self, day: NaiveDate) -> DateTime<Utc> {
        Utc.from_utc_datetime(&day.and_time(NaiveTime::default())) + self.offset
    }

    /// Cut a bounded range at day boundaries. Open ranges yield nothing.
    pub fn split(&self, range: &TimeRange) -> Vec<(NaiveDate, TimeRange)> {
        let Some(end) = range.end else {
            return Vec::new();
        };
        let mut parts = Vec::new();
        let mut begin = range.begin;
        while begin < end {
            let day = self.day_of(begin);
            let next_day = day.succ_opt().map(|d| self.day_begin(d)).unwrap_or(end);
            let part_end = next_day.min(end);
            parts.push((
                day,
                TimeRange {
                    begin,
                    end: Some(part_end),
                },
            ));
            begin = part_end;
        }
        parts
    }
}

impl Default for DayCutoff {
    fn default() -> Self {
        Self::midnight()
    }
}

/// Identifies one summary row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum SummaryKey {
    Reason {
        machine_id: i64,
        day: NaiveDate,
        shift: Option<String>,
        observation_state: Option<String>,
        reason: String,
    },
    Activity {
        machine_id: i64,
        day: NaiveDate,
        observation_state: Option<String>,
        mode_id: i64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub duration_secs: i64,
    pub number: i64,
}

impl Delta {
    pub fn is_zero(&self) -> bool {
        self.duration_secs == 0 && self.number == 0
    }
}

/// A persisted summary row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRow {
    #[serde(flatten)]
    pub key: SummaryKey,
    pub duration_secs: i64,
    pub number: i64,
}

/// Buffer of pending deltas for one machine.
#[derive(Debug, Clone)]
pub struct Accumulator {
    machine_id: i64,
    cutoff: DayCutoff,
    deltas: BTreeMap<SummaryKey, Delta>,
}

impl Accumulator {
    pub fn new(machine_id: i64, cutoff: DayCutoff) -> Self {
        Self {
            machine_id,
            cutoff,
            deltas: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Record the deltas caused by reason slot changes.
    pub fn record_reason_changes(&mut self, changes: &[SlotChange<ReasonAttrs>]) {
        for change in changes {
            let slot = change.slot();
            let input = &slot.attrs.input;
            for (day, part) in self.cutoff.split(&slot.range) {
                let secs = part.duration().map_or(0, |d| d.num_seconds());
                let delta = Delta {
                    duration_secs: change.sign() * secs,
                    number: change.sign(),
                };
                if let Some(reason) = &slot.attrs.outcome.reason {
                    self.add(
                        SummaryKey::Reason {
                            machine_id: self.machine_id,
                            day,
                            shift: input.shift.clone(),
                            observation_state: input.observation_state.clone(),
                            reason: reason.clone(),
                        },
                        delta,
                    );
                }
                self.add(
                    SummaryKey::Activity {
                        machine_id: self.machine_id,
                        day,
                        observation_state: input.observation_state.clone(),
                        mode_id: input.mode_id,
                    },
                    delta,
                );
            }
        }
    }

    fn add(&mut self, key: SummaryKey, delta: Delta) {
        let entry = self.deltas.entry(key).or_default();
        entry.duration_secs += delta.duration_secs;
        entry.number += delta.number;
    }

    /// Drain the buffered deltas, skipping those that cancelled out.
    pub fn take(&mut self) -> Vec<(SummaryKey, Delta)> {
        std::mem::take(&mut self.deltas)
            .into_iter()
            .filter(|(_, delta)| !delta.is_zero())
            .collect()
    }
}
