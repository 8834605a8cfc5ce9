//! Half-open UTC time ranges with an optionally open end.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::ValidationError;

/// A half-open range `[begin, end)`. `end == None` means the range is
/// open towards the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub begin: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

/// Compare two upper bounds, `None` being +infinity.
pub fn cmp_end(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

impl TimeRange {
    /// Create a bounded range. Empty and inverted ranges are rejected.
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ValidationError> {
        Self::with_end(begin, Some(end))
    }

    /// Create a range that is open towards the future.
    pub fn open(begin: DateTime<Utc>) -> Self {
        Self { begin, end: None }
    }

    pub fn with_end(
        begin: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Self, ValidationError> {
        let range = Self { begin, end };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.end {
            Some(end) if end <= self.begin => Err(ValidationError::InvalidTimeRange {
                start: self.begin,
                end,
            }),
            _ => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Duration of a bounded range.
    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end - self.begin)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.begin <= at && self.end.map_or(true, |end| at < end)
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        let self_before_other_end = other.end.map_or(true, |end| self.begin < end);
        let other_before_self_end = self.end.map_or(true, |end| other.begin < end);
        self_before_other_end && other_before_self_end
    }

    /// `self` ends at or before `other` begins.
    pub fn is_strictly_left_of(&self, other: &TimeRange) -> bool {
        self.end.map_or(false, |end| end <= other.begin)
    }

    pub fn is_strictly_right_of(&self, other: &TimeRange) -> bool {
        other.is_strictly_left_of(self)
    }

    /// `self` ends exactly where `other` begins.
    pub fn is_adjacent_to(&self, other: &TimeRange) -> bool {
        self.end == Some(other.begin)
    }

    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        if !self.overlaps(other) {
            return None;
        }
        let begin = self.begin.max(other.begin);
        let end = match cmp_end(self.end, other.end) {
            Ordering::Greater => other.end,
            _ => self.end,
        };
        Some(TimeRange { begin, end })
    }

    /// Smallest range covering both.
    pub fn hull(&self, other: &TimeRange) -> TimeRange {
        let end = match cmp_end(self.end, other.end) {
            Ordering::Less => other.end,
            _ => self.end,
        };
        TimeRange {
            begin: self.begin.min(other.begin),
            end,
        }
    }

    /// Cut into consecutive bounded pieces of at most `step`.
    /// Open ranges are returned unchanged.
    pub fn chunks(&self, step: Duration) -> Vec<TimeRange> {
        let Some(end) = self.end else {
            return vec![*self];
        };
        if step <= Duration::zero() {
            return vec![*self];
        }
        let mut pieces = Vec::new();
        let mut begin = self.begin;
        while begin < end {
            let piece_end = (begin + step).min(end);
            pieces.push(TimeRange {
                begin,
                end: Some(piece_end),
            });
            begin = piece_end;
        }
        pieces
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {})", self.begin.to_rfc3339(), end.to_rfc3339()),
            None => write!(f, "[{}, +oo)", self.begin.to_rfc3339()),
        }
    }
}
