//! Half-open build ranges at minute precision.

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Raised for planner input that cannot describe any work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid range: {reason}")]
pub struct InvalidRangeError {
    pub reason: String,
}

impl InvalidRangeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// `[start, end)` with seconds truncated away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDateTime,
    end: NaiveDateTime,
}

impl DateRange {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, InvalidRangeError> {
        let start = truncate_to_minute(start);
        let end = truncate_to_minute(end);
        if start >= end {
            return Err(InvalidRangeError::new(format!(
                "start {start} is not before end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse two ISO-8601 timestamps (`2024-01-01T00:00`, seconds optional, bare dates allowed).
    pub fn parse(start: &str, end: &str) -> Result<Self, InvalidRangeError> {
        Self::new(parse_timestamp(start)?, parse_timestamp(end)?)
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn end(&self) -> NaiveDateTime {
        self.end
    }

    pub fn contains(&self, t: NaiveDateTime) -> bool {
        t >= self.start && t < self.end
    }

    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// Calendar days touched by the range, ascending.
    pub fn days(&self) -> Vec<NaiveDate> {
        let first = self.start.date();
        let last = (self.end - Duration::minutes(1)).date();
        first.iter_days().take_while(|d| *d <= last).collect()
    }

    /// 1-based position of `day` within [`Self::days`].
    pub fn day_index(&self, day: NaiveDate) -> Option<usize> {
        let offset = (day - self.start.date()).num_days();
        let total = self.days().len() as i64;
        (0..total).contains(&offset).then(|| offset as usize + 1)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}",
            self.start.format("%Y-%m-%dT%H:%M"),
            self.end.format("%Y-%m-%dT%H:%M")
        )
    }
}

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, InvalidRangeError> {
    let s = s.trim();
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(truncate_to_minute(t));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| InvalidRangeError::new(format!("cannot parse timestamp '{s}'")))
}

fn truncate_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_inverted_ranges() {
        assert!(DateRange::parse("2024-01-01T00:00", "2024-01-01T00:00").is_err());
        assert!(DateRange::parse("2024-01-02", "2024-01-01").is_err());
    }

    #[test]
    fn seconds_are_truncated() {
        let r = DateRange::parse("2024-01-01T00:01:30", "2024-01-01T01:00:59").unwrap();
        assert_eq!(r.start().second(), 0);
        assert_eq!(r.minutes(), 59);
    }

    #[test]
    fn days_of_half_open_range() {
        let r = DateRange::parse("2024-01-01", "2024-01-03").unwrap();
        let days = r.days();
        assert_eq!(days.len(), 2);
        assert_eq!(r.day_index(days[1]), Some(2));
        assert_eq!(
            r.day_index(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()),
            None
        );
    }
}
