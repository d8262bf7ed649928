//! Half-open UTC time ranges with an optional (unbounded) end.

use std::fmt;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ValidationError;

/// A `[begin, end)` range of UTC instants.
///
/// `end: None` means the range is open towards the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub begin: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// Creates a bounded range. `end` must not precede `begin`.
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ValidationError> {
        if end < begin {
            return Err(ValidationError::InvertedRange {
                begin: begin.to_rfc3339_opts(SecondsFormat::Millis, true),
                end: end.to_rfc3339_opts(SecondsFormat::Millis, true),
            });
        }
        Ok(Self {
            begin,
            end: Some(end),
        })
    }

    /// Creates a range starting at `begin` and open towards the future.
    pub const fn from(begin: DateTime<Utc>) -> Self {
        Self { begin, end: None }
    }

    /// Creates a range from an optional end, clamping an inverted end to `begin`.
    pub fn clamped(begin: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        Self {
            begin,
            end: end.map(|end| end.max(begin)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end.is_some_and(|end| end <= self.begin)
    }

    pub const fn is_unbounded(&self) -> bool {
        self.end.is_none()
    }

    /// Duration of a bounded range.
    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end - self.begin)
    }

    /// Returns true if `t` lies in `[begin, end)`.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.begin <= t && self.end.is_none_or(|end| t < end)
    }

    /// Returns true if `t` lies in `[begin, end]`.
    pub fn contains_considering_end(&self, t: DateTime<Utc>) -> bool {
        self.begin <= t && self.end.is_none_or(|end| t <= end)
    }

    /// Returns true if `other` is entirely inside this range.
    pub fn contains_range(&self, other: &Self) -> bool {
        if other.begin < self.begin {
            return false;
        }
        match (self.end, other.end) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(end), Some(other_end)) => other_end <= end,
        }
    }

    /// Returns true if both ranges share at least one instant.
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.end.is_none_or(|end| other.begin < end)
            && other.end.is_none_or(|other_end| self.begin < other_end)
    }

    /// Returns the common part of both ranges, if any.
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.overlaps(other) {
            return None;
        }
        let begin = self.begin.max(other.begin);
        let end = match (self.end, other.end) {
            (None, end) | (end, None) => end,
            (Some(a), Some(b)) => Some(a.min(b)),
        };
        Some(Self { begin, end })
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let begin = self.begin.to_rfc3339_opts(SecondsFormat::Millis, true);
        match self.end {
            Some(end) => write!(
                f,
                "[{begin}, {})",
                end.to_rfc3339_opts(SecondsFormat::Millis, true)
            ),
            None => write!(f, "[{begin}, )"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn new_rejects_inverted_range() {
        assert!(TimeRange::new(at(10), at(5)).is_err());
        assert!(TimeRange::new(at(5), at(5)).unwrap().is_empty());
    }

    #[test]
    fn contains_is_half_open() {
        let range = TimeRange::new(at(0), at(10)).unwrap();
        assert!(range.contains(at(0)));
        assert!(range.contains(at(9)));
        assert!(!range.contains(at(10)));
        assert!(range.contains_considering_end(at(10)));
        assert!(TimeRange::from(at(0)).contains(at(1_000_000)));
    }

    #[test]
    fn overlaps_ignores_adjacent_ranges() {
        let a = TimeRange::new(at(0), at(10)).unwrap();
        let b = TimeRange::new(at(10), at(20)).unwrap();
        let c = TimeRange::from(at(5));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn intersection_clips_open_ranges() {
        let a = TimeRange::from(at(5));
        let b = TimeRange::new(at(0), at(10)).unwrap();
        assert_eq!(a.intersection(&b), Some(TimeRange::new(at(5), at(10)).unwrap()));
        assert_eq!(
            a.intersection(&TimeRange::from(at(8))),
            Some(TimeRange::from(at(8)))
        );
    }

    #[test]
    fn contains_range_handles_unbounded_ends() {
        let open = TimeRange::from(at(0));
        let bounded = TimeRange::new(at(1), at(2)).unwrap();
        assert!(open.contains_range(&bounded));
        assert!(!bounded.contains_range(&open));
    }

    #[test]
    fn display_uses_millisecond_timestamps() {
        let range = TimeRange::new(at(0), at(1)).unwrap();
        assert_eq!(
            range.to_string(),
            "[2023-11-14T22:13:20.000Z, 2023-11-14T22:13:21.000Z)"
        );
        assert_eq!(TimeRange::from(at(0)).to_string(), "[2023-11-14T22:13:20.000Z, )");
    }
}
