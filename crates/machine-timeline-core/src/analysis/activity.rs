//! Folding new facts into the reason timeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::machine::MachineAnalysis;
use crate::autosequence::{sequence_tags, AutoSequenceMatcher, AutoSequencePeriod};
use crate::error::Result;
use crate::model::Fact;
use crate::storage::Database;
use crate::timeline::{ObservationAttrs, Partition, ReasonAttrs, ReasonInput, TimeRange};

/// Result of one activity batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ActivityBatch {
    pub facts: usize,
    /// The watermark moved forward; another batch may find more facts.
    pub advanced: bool,
}

/// Result of one auto-sequence batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AutoSequenceBatch {
    /// Activity periods matched, eligible or not.
    pub periods: usize,
    /// Reason ranges tagged with a sequence.
    pub tagged: usize,
    pub advanced: bool,
}

impl MachineAnalysis {
    /// Fold the next batch of facts past the watermark into reason slots,
    /// refresh operation run-times and advance the watermark.
    pub fn process_activity(&mut self, db: &Database) -> Result<ActivityBatch> {
        let watermark = self.timeline.watermark;
        let facts: Vec<Fact> = db
            .facts_after(self.machine_id, watermark, self.context.analysis.activity_batch_size)?
            .into_iter()
            .map(|fact| clip(fact, watermark))
            .collect();
        let Some(window) = window(&facts) else {
            return Ok(ActivityBatch::default());
        };

        for fact in &facts {
            let pieces = split_by_observation(&self.timeline.observation, &fact.range);
            for (range, observation) in pieces {
                let input = ReasonInput {
                    mode_id: fact.mode_id,
                    observation_state: observation.map(|o| o.observation_state.clone()),
                    shift: observation.and_then(|o| o.shift.clone()),
                    auto_sequence: None,
                    manual: None,
                };
                let changes = self.timeline.reasons.insert(range, ReasonAttrs::new(input))?;
                self.journal.reasons.extend(changes);
            }
        }

        self.refresh_run_times(db, &window)?;

        let new_watermark = facts
            .iter()
            .map(|fact| fact.range.end.unwrap_or(fact.range.begin))
            .chain(watermark)
            .max();
        let advanced = new_watermark > watermark;
        self.set_watermark(new_watermark);
        self.consolidate_range(&window);

        debug!(
            machine_id = self.machine_id,
            facts = facts.len(),
            watermark = ?new_watermark,
            "activity batch folded"
        );
        Ok(ActivityBatch {
            facts: facts.len(),
            advanced,
        })
    }

    /// Tag the reason slots between the auto-sequence watermark and the
    /// watermark with the auto-sequences overlapping their eligible runs.
    ///
    /// An eligible run that no auto-sequence overlaps or follows yet holds
    /// the auto-sequence watermark at its begin, so the run is matched
    /// again once its auto-sequence is recorded. The hold never reaches
    /// further back than the modification span.
    pub fn process_auto_sequences(&mut self, db: &Database) -> Result<AutoSequenceBatch> {
        let Some(data_end) = self.timeline.watermark else {
            return Ok(AutoSequenceBatch::default());
        };
        let from = self.timeline.auto_sequence_watermark;
        if from.is_some_and(|from| from >= data_end) {
            return Ok(AutoSequenceBatch::default());
        }

        let modes = &self.context.modes;
        let periods: Vec<AutoSequencePeriod> = db
            .facts_after(self.machine_id, from, self.context.analysis.activity_batch_size)?
            .into_iter()
            .filter_map(|fact| {
                let eligible = modes.supports_auto_sequence(fact.mode_id);
                let fact = clip(fact, from);
                let analysed = TimeRange {
                    begin: fact.range.begin,
                    end: Some(data_end),
                };
                let range = fact.range.intersection(&analysed)?;
                Some(AutoSequencePeriod::new(range, eligible))
            })
            .collect();
        let Some(window) = periods
            .iter()
            .map(|period| period.range)
            .reduce(|acc, range| acc.hull(&range))
        else {
            // Nothing was recorded between the two watermarks.
            self.set_auto_sequence_watermark(Some(data_end));
            return Ok(AutoSequenceBatch {
                advanced: true,
                ..AutoSequenceBatch::default()
            });
        };

        let auto_sequences = db.auto_sequences_overlapping(
            self.machine_id,
            &window,
            self.context.analysis.auto_sequence_max_items,
        )?;
        let after_window = match window.end {
            Some(end) => db.first_auto_sequence_after(self.machine_id, end)?,
            None => None,
        };
        let mut matcher = AutoSequenceMatcher::new(window, periods, auto_sequences, after_window);
        let mut matched = 0;
        let mut tags: Vec<(TimeRange, String)> = Vec::new();
        while let Some(step) = matcher.next_periods() {
            matched += step.periods.len();
            tags.extend(sequence_tags(&step));
        }
        // A run waits at most the modification span for its auto-sequence.
        let oldest = data_end - self.context.max_modification_span();
        let held = matcher.pending().map(|period| period.range.begin);
        let new_watermark = match held {
            Some(held) => held.max(oldest),
            None => window.end.unwrap_or(data_end),
        };

        if let Some(tagged) = tags
            .iter()
            .map(|(range, _)| *range)
            .reduce(|acc, range| acc.hull(&range))
        {
            self.timeline.ensure_loaded(db, tagged.begin)?;
            for (range, sequence) in &tags {
                self.rewrite_reason_inputs(range, |input| {
                    input.auto_sequence = Some(sequence.clone())
                })?;
            }
            self.consolidate_range(&tagged);
        }

        let advanced = from.map_or(true, |from| new_watermark > from);
        self.set_auto_sequence_watermark(Some(new_watermark));
        debug!(
            machine_id = self.machine_id,
            periods = matched,
            tagged = tags.len(),
            held = ?held,
            auto_sequence_watermark = %new_watermark,
            "auto-sequences matched"
        );
        Ok(AutoSequenceBatch {
            periods: matched,
            tagged: tags.len(),
            advanced,
        })
    }
}

/// Drop the part of a fact already covered by the watermark.
fn clip(mut fact: Fact, watermark: Option<DateTime<Utc>>) -> Fact {
    if let Some(watermark) = watermark {
        if fact.range.begin < watermark {
            fact.range.begin = watermark;
        }
    }
    fact
}

/// Span from the first fact's begin to the furthest end.
fn window(facts: &[Fact]) -> Option<TimeRange> {
    let first = facts.first()?;
    Some(
        facts
            .iter()
            .fold(first.range, |acc, fact| acc.hull(&fact.range)),
    )
}

/// Pieces of `range` with the observation slot covering each; gaps between
/// observation slots yield `None`.
fn split_by_observation<'a>(
    observation: &'a Partition<ObservationAttrs>,
    range: &TimeRange,
) -> Vec<(TimeRange, Option<&'a ObservationAttrs>)> {
    let mut pieces = Vec::new();
    let mut cursor = Some(range.begin);
    for slot in observation.overlapping(range) {
        let Some(begin) = cursor else {
            break;
        };
        let Some(part) = slot.range.intersection(range) else {
            continue;
        };
        if part.begin > begin {
            pieces.push((
                TimeRange {
                    begin,
                    end: Some(part.begin),
                },
                None,
            ));
        }
        pieces.push((part, Some(&slot.attrs)));
        cursor = part.end;
    }
    if let Some(begin) = cursor {
        if range.end.map_or(true, |end| begin < end) {
            pieces.push((
                TimeRange {
                    begin,
                    end: range.end,
                },
                None,
            ));
        }
    }
    pieces
}
