//! Correlation of activity periods with controller auto-sequences.
//!
//! Activity periods carry an eligibility flag (the mode supports
//! auto-sequences). [`AutoSequenceMatcher`] walks the periods and the
//! auto-sequences, both sorted by begin, and yields one step per run of
//! periods together with the auto-sequences overlapping that run.
//! Auto-sequences that extend past a run are not consumed, so one
//! auto-sequence may match several successive runs and one run may match
//! several auto-sequences.
//!
//! An eligible run that no auto-sequence overlaps or follows yet is not
//! returned: its auto-sequence may still be recorded. The matcher stops
//! there and [`AutoSequenceMatcher::pending`] gives the run's first period.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::model::AutoSequence;
use crate::timeline::TimeRange;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoSequencePeriod {
    pub range: TimeRange,
    pub auto_sequence: bool,
}

impl AutoSequencePeriod {
    pub fn new(range: TimeRange, auto_sequence: bool) -> Self {
        Self {
            range,
            auto_sequence,
        }
    }
}

/// Drop the non-eligible periods at both ends. Inner periods are kept.
pub fn trim(periods: &[AutoSequencePeriod]) -> Vec<AutoSequencePeriod> {
    let Some(first) = periods.iter().position(|p| p.auto_sequence) else {
        return Vec::new();
    };
    let last = periods
        .iter()
        .rposition(|p| p.auto_sequence)
        .unwrap_or(first);
    periods[first..=last].to_vec()
}

/// One step of the matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoSequenceStep {
    /// Consecutive periods sharing the same eligibility.
    pub periods: Vec<AutoSequencePeriod>,
    /// Auto-sequences overlapping those periods; empty for a non-eligible run.
    pub matching: Vec<AutoSequence>,
}

impl AutoSequenceStep {
    pub fn auto_sequence(&self) -> bool {
        self.periods.first().map_or(false, |p| p.auto_sequence)
    }

    /// Range from the first period's begin to the last period's end.
    pub fn range(&self) -> Option<TimeRange> {
        let first = self.periods.first()?;
        let last = self.periods.last()?;
        Some(TimeRange {
            begin: first.range.begin,
            end: last.range.end,
        })
    }
}

/// Single-step pull over periods and auto-sequences.
pub struct AutoSequenceMatcher {
    window: TimeRange,
    periods: VecDeque<AutoSequencePeriod>,
    auto_sequences: VecDeque<AutoSequence>,
    after_window: Option<AutoSequence>,
}

impl AutoSequenceMatcher {
    /// `after_window` is the first auto-sequence starting at or after the
    /// window end, consulted once the loaded auto-sequences run out.
    pub fn new(
        window: TimeRange,
        periods: impl IntoIterator<Item = AutoSequencePeriod>,
        auto_sequences: impl IntoIterator<Item = AutoSequence>,
        after_window: Option<AutoSequence>,
    ) -> Self {
        Self {
            window,
            periods: periods.into_iter().collect(),
            auto_sequences: auto_sequences.into_iter().collect(),
            after_window,
        }
    }

    pub fn window(&self) -> &TimeRange {
        &self.window
    }

    /// Next run of periods and its matching auto-sequences. `None` once the
    /// periods are exhausted, or when the next run is eligible and no
    /// auto-sequence overlaps or follows it.
    pub fn next_periods(&mut self) -> Option<AutoSequenceStep> {
        let first = self.periods.front()?.clone();

        if !first.auto_sequence {
            let periods = self.take_periods(|p| !p.auto_sequence);
            return Some(AutoSequenceStep {
                periods,
                matching: Vec::new(),
            });
        }

        while self
            .auto_sequences
            .front()
            .map_or(false, |a| a.range.is_strictly_left_of(&first.range))
        {
            self.auto_sequences.pop_front();
        }

        let last_overlapping = self
            .auto_sequences
            .iter()
            .take_while(|a| first.range.end.map_or(true, |end| a.range.begin < end))
            .filter(|a| a.range.overlaps(&first.range))
            .last()
            .map(|a| a.range);

        if let Some(last) = last_overlapping {
            let periods =
                self.take_periods(|p| p.auto_sequence && !p.range.is_strictly_right_of(&last));
            let run = span(&periods);
            let matching = self
                .auto_sequences
                .iter()
                .filter(|a| run.map_or(false, |run| a.range.overlaps(&run)))
                .cloned()
                .collect();
            return Some(AutoSequenceStep { periods, matching });
        }

        let next_begin = self
            .auto_sequences
            .front()
            .or(self.after_window.as_ref())
            .map(|a| a.range.begin)?;
        let mut periods = self.take_periods(|p| {
            p.auto_sequence && p.range.end.map_or(false, |end| end <= next_begin)
        });
        if periods.is_empty() {
            if let Some(period) = self.periods.pop_front() {
                periods.push(period);
            }
        }
        Some(AutoSequenceStep {
            periods,
            matching: Vec::new(),
        })
    }

    /// First period not returned yet: the start of an eligible run that
    /// waits for its auto-sequence, when the matcher stopped early.
    pub fn pending(&self) -> Option<&AutoSequencePeriod> {
        self.periods.front()
    }

    fn take_periods<F>(&mut self, keep: F) -> Vec<AutoSequencePeriod>
    where
        F: Fn(&AutoSequencePeriod) -> bool,
    {
        let mut taken = Vec::new();
        while let Some(period) = self.periods.front() {
            if !keep(period) {
                break;
            }
            if let Some(period) = self.periods.pop_front() {
                taken.push(period);
            }
        }
        taken
    }
}

impl Iterator for AutoSequenceMatcher {
    type Item = AutoSequenceStep;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_periods()
    }
}

fn span(periods: &[AutoSequencePeriod]) -> Option<TimeRange> {
    let first = periods.first()?;
    let last = periods.last()?;
    Some(TimeRange {
        begin: first.range.begin,
        end: last.range.end,
    })
}

/// Ranges of the eligible periods of `step` covered by each matching
/// auto-sequence, tagged with the sequence.
pub fn sequence_tags(step: &AutoSequenceStep) -> Vec<(TimeRange, String)> {
    let mut tags = Vec::new();
    for auto_sequence in &step.matching {
        for period in step.periods.iter().filter(|p| p.auto_sequence) {
            if let Some(range) = period.range.intersection(&auto_sequence.range) {
                tags.push((range, auto_sequence.sequence.clone()));
            }
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn t(hours: f64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 11, 13, 0, 0, 0).unwrap()
            + Duration::minutes((hours * 60.0).round() as i64)
    }

    fn period(begin: f64, end: f64, auto_sequence: bool) -> AutoSequencePeriod {
        AutoSequencePeriod::new(TimeRange::new(t(begin), t(end)).unwrap(), auto_sequence)
    }

    fn auto_sequence(id: i64, begin: f64, end: f64) -> AutoSequence {
        AutoSequence {
            id,
            machine_id: 1,
            module_id: 1,
            range: TimeRange::new(t(begin), t(end)).unwrap(),
            sequence: format!("seq-{id}"),
        }
    }

    #[test]
    fn trim_empty_input() {
        assert!(trim(&[]).is_empty());
    }

    #[test]
    fn trim_inactive_only() {
        let periods = vec![period(1.0, 2.0, false), period(3.0, 4.0, false)];
        assert!(trim(&periods).is_empty());
    }

    #[test]
    fn trim_keeps_active_periods() {
        let periods = vec![period(1.0, 2.0, true), period(3.0, 4.0, true)];
        assert_eq!(trim(&periods).len(), 2);
    }

    #[test]
    fn trim_drops_inactive_ends() {
        let periods = vec![
            period(1.0, 2.0, false),
            period(2.0, 4.0, true),
            period(4.0, 5.0, true),
            period(7.0, 8.0, false),
        ];
        let trimmed = trim(&periods);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0].range.begin, t(2.0));
        assert_eq!(trimmed[1].range.end, Some(t(5.0)));
    }

    #[test]
    fn exhausted_matcher_keeps_returning_none() {
        let window = TimeRange::new(t(0.0), t(1.0)).unwrap();
        let mut matcher = AutoSequenceMatcher::new(
            window,
            vec![period(0.0, 1.0, true)],
            vec![auto_sequence(1, 0.0, 1.0)],
            None,
        );
        assert!(matcher.next_periods().is_some());
        for _ in 0..3 {
            assert_eq!(matcher.next_periods(), None);
        }
    }

    #[test]
    fn eligible_run_without_auto_sequence_waits() {
        let window = TimeRange::new(t(0.0), t(4.0)).unwrap();
        let mut matcher = AutoSequenceMatcher::new(
            window,
            vec![
                period(0.0, 1.0, false),
                period(1.0, 2.0, true),
                period(2.0, 3.0, true),
            ],
            Vec::new(),
            None,
        );
        let step = matcher.next_periods().unwrap();
        assert!(!step.auto_sequence());
        assert_eq!(step.periods.len(), 1);

        assert_eq!(matcher.next_periods(), None);
        assert_eq!(matcher.pending(), Some(&period(1.0, 2.0, true)));
        assert_eq!(matcher.next_periods(), None);
    }

    #[test]
    fn exhausted_matcher_has_nothing_pending() {
        let window = TimeRange::new(t(0.0), t(2.0)).unwrap();
        let mut matcher = AutoSequenceMatcher::new(
            window,
            vec![period(0.0, 1.0, true), period(1.0, 2.0, false)],
            vec![auto_sequence(1, 0.0, 0.5)],
            None,
        );
        let steps: Vec<_> = matcher.by_ref().collect();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].matching.len(), 1);
        assert!(matcher.pending().is_none());
    }

    #[test]
    fn auto_sequence_after_window_bounds_the_run() {
        let window = TimeRange::new(t(0.0), t(3.0)).unwrap();
        let mut matcher = AutoSequenceMatcher::new(
            window,
            vec![period(0.0, 1.0, true), period(1.0, 3.0, true)],
            Vec::new(),
            Some(auto_sequence(9, 2.0, 5.0)),
        );
        let step = matcher.next_periods().unwrap();
        assert_eq!(step.periods.len(), 1);
        assert_eq!(step.range(), Some(TimeRange::new(t(0.0), t(1.0)).unwrap()));
    }

    #[test]
    fn sequence_tags_intersect_periods() {
        let step = AutoSequenceStep {
            periods: vec![period(9.0, 11.0, true), period(12.0, 13.0, true)],
            matching: vec![auto_sequence(2, 10.0, 15.0)],
        };
        let tags = sequence_tags(&step);
        assert_eq!(
            tags,
            vec![
                (TimeRange::new(t(10.0), t(11.0)).unwrap(), "seq-2".to_string()),
                (TimeRange::new(t(12.0), t(13.0)).unwrap(), "seq-2".to_string()),
            ]
        );
    }

    proptest! {
        #[test]
        fn trim_is_idempotent(flags in prop::collection::vec(any::<bool>(), 0..20)) {
            let periods: Vec<_> = flags
                .iter()
                .enumerate()
                .map(|(i, flag)| period(i as f64, i as f64 + 1.0, *flag))
                .collect();
            let once = trim(&periods);
            prop_assert_eq!(trim(&once), once.clone());
            if let (Some(first), Some(last)) = (once.first(), once.last()) {
                prop_assert!(first.auto_sequence && last.auto_sequence);
            }
        }

        #[test]
        fn matcher_returns_every_period_once(flags in prop::collection::vec(any::<bool>(), 0..20)) {
            let periods: Vec<_> = flags
                .iter()
                .enumerate()
                .map(|(i, flag)| period(i as f64, i as f64 + 1.0, *flag))
                .collect();
            let auto_sequences = vec![auto_sequence(1, 2.5, 4.5), auto_sequence(2, 10.0, 12.0)];
            let window = TimeRange::new(t(0.0), t(20.0)).unwrap();
            let mut matcher =
                AutoSequenceMatcher::new(window, periods.clone(), auto_sequences, None);
            let returned: Vec<_> = matcher.by_ref().flat_map(|step| step.periods).collect();
            let rest = &periods[returned.len()..];
            prop_assert_eq!(&returned[..], &periods[..returned.len()]);
            prop_assert_eq!(matcher.pending(), rest.first());
            // Only an eligible run past every auto-sequence is held back.
            if let Some(waiting) = rest.first() {
                prop_assert!(waiting.auto_sequence);
                prop_assert!(waiting.range.begin >= t(12.0));
            }
        }
    }
}
