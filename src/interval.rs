//! Interval calculator.
//!
//! Maps wall-clock timestamps (Unix milliseconds, UTC) onto the segment/family
//! hierarchy used by the storage layer. Three granularities exist:
//!
//! | interval        | segment       | family        |
//! |-----------------|---------------|---------------|
//! | `< 5 minutes`   | day `yyyyMMdd`| hour of day   |
//! | `< 1 hour`      | month `yyyyMM`| day of month  |
//! | `>= 1 hour`     | year `yyyy`   | month of year |

use crate::{LinDbError, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const ONE_SECOND: i64 = 1000;
pub const ONE_MINUTE: i64 = 60 * ONE_SECOND;
pub const ONE_HOUR: i64 = 60 * ONE_MINUTE;
pub const ONE_DAY: i64 = 24 * ONE_HOUR;

/// Returns the current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn to_datetime(timestamp: i64) -> NaiveDateTime {
    DateTime::from_timestamp_millis(timestamp)
        .unwrap_or_default()
        .naive_utc()
}

fn date_millis(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0)
}

/// Inclusive time range in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn validate(&self) -> Result<()> {
        if self.start > self.end {
            return Err(LinDbError::InvalidTimeRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start <= other.end && self.end >= other.start
    }

    /// Returns the overlapping part of two ranges.
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        if !self.overlaps(other) {
            return None;
        }
        Some(TimeRange::new(
            self.start.max(other.start),
            self.end.min(other.end),
        ))
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Calendar granularity of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntervalType {
    Day,
    Month,
    Year,
}

impl IntervalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalType::Day => "day",
            IntervalType::Month => "month",
            IntervalType::Year => "year",
        }
    }

    /// Returns the segment name a timestamp falls into.
    pub fn segment_name(&self, timestamp: i64) -> String {
        let dt = to_datetime(timestamp);
        match self {
            IntervalType::Day => dt.format("%Y%m%d").to_string(),
            IntervalType::Month => dt.format("%Y%m").to_string(),
            IntervalType::Year => dt.format("%Y").to_string(),
        }
    }

    /// Parses a segment name back into the segment start time.
    pub fn parse_segment_time(&self, name: &str) -> Result<i64> {
        let (expected_len, padded) = match self {
            IntervalType::Day => (8, name.to_string()),
            IntervalType::Month => (6, format!("{name}01")),
            IntervalType::Year => (4, format!("{name}0101")),
        };
        if name.len() != expected_len || !name.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LinDbError::InvalidSegment(name.to_string()));
        }
        let date = NaiveDate::parse_from_str(&padded, "%Y%m%d")
            .map_err(|e| LinDbError::InvalidSegment(format!("{name}: {e}")))?;
        Ok(date_millis(date))
    }

    /// Returns the start time of the segment a timestamp falls into.
    pub fn calc_segment_time(&self, timestamp: i64) -> i64 {
        let date = to_datetime(timestamp).date();
        let start = match self {
            IntervalType::Day => Some(date),
            IntervalType::Month => date.with_day(1),
            IntervalType::Year => date.with_day(1).and_then(|d| d.with_month(1)),
        };
        start.map(date_millis).unwrap_or(0)
    }

    /// Returns the family number of a timestamp within its segment.
    pub fn calc_family(&self, timestamp: i64, _segment_time: i64) -> i32 {
        let dt = to_datetime(timestamp);
        match self {
            IntervalType::Day => dt.hour() as i32,
            IntervalType::Month => dt.day() as i32,
            IntervalType::Year => dt.month() as i32,
        }
    }

    /// Returns the start time of a family within a segment.
    pub fn calc_family_time(&self, segment_time: i64, family: i32) -> i64 {
        self.calc_family_start_time(segment_time, family)
    }

    pub fn calc_family_start_time(&self, segment_time: i64, family: i32) -> i64 {
        match self {
            IntervalType::Day => segment_time + family as i64 * ONE_HOUR,
            IntervalType::Month => segment_time + (family as i64 - 1) * ONE_DAY,
            IntervalType::Year => to_datetime(segment_time)
                .date()
                .with_month(family.clamp(1, 12) as u32)
                .map(date_millis)
                .unwrap_or(segment_time),
        }
    }

    /// Returns the last millisecond that still belongs to the family.
    pub fn calc_family_end_time(&self, segment_time: i64, family: i32) -> i64 {
        match self {
            IntervalType::Day => self.calc_family_start_time(segment_time, family) + ONE_HOUR - 1,
            IntervalType::Month => self.calc_family_start_time(segment_time, family) + ONE_DAY - 1,
            IntervalType::Year => {
                let start = to_datetime(self.calc_family_start_time(segment_time, family)).date();
                let next = if start.month() == 12 {
                    NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)
                } else {
                    start.with_month(start.month() + 1)
                };
                next.map(date_millis).unwrap_or(segment_time) - 1
            }
        }
    }

    /// Returns the family start time a timestamp falls into.
    pub fn family_time(&self, timestamp: i64) -> i64 {
        let segment_time = self.calc_segment_time(timestamp);
        let family = self.calc_family(timestamp, segment_time);
        self.calc_family_time(segment_time, family)
    }

    /// Returns the full time range of the family starting at `family_time`.
    pub fn family_time_range(&self, family_time: i64) -> TimeRange {
        let segment_time = self.calc_segment_time(family_time);
        let family = self.calc_family(family_time, segment_time);
        TimeRange::new(
            family_time,
            self.calc_family_end_time(segment_time, family),
        )
    }

    /// Returns the full time range of the segment starting at `segment_time`.
    pub fn segment_time_range(&self, segment_time: i64) -> TimeRange {
        let date = to_datetime(segment_time).date();
        let next = match self {
            IntervalType::Day => date.succ_opt(),
            IntervalType::Month => {
                if date.month() == 12 {
                    NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
                } else {
                    date.with_month(date.month() + 1)
                }
            }
            IntervalType::Year => NaiveDate::from_ymd_opt(date.year() + 1, 1, 1),
        };
        TimeRange::new(segment_time, next.map(date_millis).unwrap_or(i64::MAX) - 1)
    }
}

impl fmt::Display for IntervalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A storage interval in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval(i64);

impl Interval {
    pub fn new(millis: i64) -> Result<Self> {
        if millis <= 0 {
            return Err(LinDbError::InvalidInterval(format!(
                "interval must be positive, got {millis}ms"
            )));
        }
        Ok(Self(millis))
    }

    pub fn from_secs(secs: i64) -> Self {
        Self(secs.max(1) * ONE_SECOND)
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    pub fn interval_type(&self) -> IntervalType {
        if self.0 < 5 * ONE_MINUTE {
            IntervalType::Day
        } else if self.0 < ONE_HOUR {
            IntervalType::Month
        } else {
            IntervalType::Year
        }
    }

    /// Slot index of a timestamp inside a family.
    pub fn slot(&self, family_time: i64, timestamp: i64) -> u16 {
        ((timestamp - family_time).max(0) / self.0).min(u16::MAX as i64) as u16
    }

    /// Timestamp of a slot inside a family.
    pub fn slot_time(&self, family_time: i64, slot: u16) -> i64 {
        family_time + slot as i64 * self.0
    }
}

impl FromStr for Interval {
    type Err = LinDbError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| LinDbError::InvalidInterval(s.to_string()))?;
        let (value, unit) = s.split_at(split);
        let value: i64 = value
            .parse()
            .map_err(|_| LinDbError::InvalidInterval(s.to_string()))?;
        let factor = match unit {
            "ms" => 1,
            "s" => ONE_SECOND,
            "m" => ONE_MINUTE,
            "h" => ONE_HOUR,
            "d" => ONE_DAY,
            _ => return Err(LinDbError::InvalidInterval(s.to_string())),
        };
        let millis = value
            .checked_mul(factor)
            .ok_or_else(|| LinDbError::InvalidInterval(s.to_string()))?;
        Interval::new(millis)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (factor, unit) in [(ONE_DAY, "d"), (ONE_HOUR, "h"), (ONE_MINUTE, "m"), (ONE_SECOND, "s")] {
            if self.0 % factor == 0 {
                return write!(f, "{}{}", self.0 / factor, unit);
            }
        }
        write!(f, "{}ms", self.0)
    }
}
