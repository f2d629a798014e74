//! Hour-aligned wall-clock intervals
//!
//! Every range the planner and checkpoints handle is half-open
//! `[start, end)` with both endpoints on UTC hour boundaries. Alignment is
//! established once at task creation (`align_outward`) and preserved by the
//! splitting arithmetic afterwards.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

/// Half-open `[start, end)` interval in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Build a range, rejecting empty or inverted intervals.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(HarvestError::InvalidTime(format!(
                "range start {start} must precede end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Smallest hour-aligned range covering `[start, end)`.
    pub fn align_outward(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        Self::new(floor_hour(start), ceil_hour(end))
    }

    /// Width in whole hours. Zero only for sub-hour unaligned ranges, which
    /// the constructors never produce.
    #[must_use]
    pub fn hours(&self) -> i64 {
        (self.end - self.start).num_hours()
    }

    /// Whether both endpoints sit on an hour boundary.
    #[must_use]
    pub fn is_hour_aligned(&self) -> bool {
        floor_hour(self.start) == self.start && floor_hour(self.end) == self.end
    }

    #[must_use]
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }

    /// Split at the midpoint rounded to the nearest hour.
    ///
    /// Returns `None` when the range is at the one-hour resolution floor.
    /// When rounding collides with an endpoint the split favours the later
    /// half, so both children are always non-empty.
    #[must_use]
    pub fn split_at_hour_midpoint(&self) -> Option<(TimeRange, TimeRange)> {
        if self.end - self.start <= Duration::hours(1) {
            return None;
        }

        let mut mid = round_hour(self.start + (self.end - self.start) / 2);
        if mid <= self.start {
            mid = self.start + Duration::hours(1);
        } else if mid >= self.end {
            mid = self.end - Duration::hours(1);
        }

        Some((
            TimeRange {
                start: self.start,
                end: mid,
            },
            TimeRange {
                start: mid,
                end: self.end,
            },
        ))
    }
}

/// Truncate to the containing hour boundary.
#[must_use]
pub fn floor_hour(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .duration_trunc(Duration::hours(1))
        .unwrap_or(instant)
}

/// Advance to the next hour boundary unless already on one.
#[must_use]
pub fn ceil_hour(instant: DateTime<Utc>) -> DateTime<Utc> {
    let floored = floor_hour(instant);
    if floored == instant {
        instant
    } else {
        floored + Duration::hours(1)
    }
}

/// Round to the nearest hour boundary, half away from the past.
#[must_use]
pub fn round_hour(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .duration_round(Duration::hours(1))
        .unwrap_or_else(|_| floor_hour(instant))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, h, m, 0).unwrap()
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(TimeRange::new(at(10, 0), at(9, 0)).is_err());
        assert!(TimeRange::new(at(10, 0), at(10, 0)).is_err());
    }

    #[test]
    fn align_outward_covers_input() {
        let range = TimeRange::align_outward(at(9, 20), at(11, 5)).unwrap();
        assert_eq!(range.start, at(9, 0));
        assert_eq!(range.end, at(12, 0));
        assert!(range.is_hour_aligned());
    }

    #[test]
    fn one_hour_range_is_leaf() {
        let range = TimeRange::new(at(9, 0), at(10, 0)).unwrap();
        assert!(range.split_at_hour_midpoint().is_none());
    }

    #[test]
    fn split_preserves_partition() {
        let range = TimeRange::new(at(0, 0), at(12, 0)).unwrap();
        let (left, right) = range.split_at_hour_midpoint().unwrap();
        assert_eq!(left.start, range.start);
        assert_eq!(left.end, right.start);
        assert_eq!(right.end, range.end);
        assert_eq!(left.end, at(6, 0));
    }

    #[test]
    fn split_of_two_hours_yields_two_leaves() {
        let range = TimeRange::new(at(3, 0), at(5, 0)).unwrap();
        let (left, right) = range.split_at_hour_midpoint().unwrap();
        assert_eq!(left.hours(), 1);
        assert_eq!(right.hours(), 1);
    }
}
