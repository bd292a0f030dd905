//! Alignment of a query's interval and time range with storage slots.

use crate::interval::{Interval, TimeRange};
use crate::{LinDbError, Result};

/// How storage slots are folded into query windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownSampling {
    /// Number of storage slots per query window, at least 1.
    pub ratio: i64,
    /// Effective window: storage interval times ratio.
    pub interval: Interval,
    /// Query range truncated to window boundaries.
    pub time_range: TimeRange,
}

impl DownSampling {
    /// Negotiates the window of a query against the storage interval. A
    /// missing or smaller query interval falls back to the storage interval.
    pub fn calc(
        query_interval: Option<Interval>,
        storage_interval: Interval,
        time_range: TimeRange,
    ) -> Result<Self> {
        time_range.validate()?;
        let storage = storage_interval.millis();
        let requested = query_interval.map_or(storage, |i| i.millis());
        let ratio = (requested / storage).max(1);
        let interval = Interval::new(storage * ratio)?;

        let window = interval.millis();
        let truncated = TimeRange::new(
            truncate(time_range.start, window),
            truncate(time_range.end, window),
        );
        if truncated.start > truncated.end {
            return Err(LinDbError::InvalidTimeRange {
                start: truncated.start,
                end: truncated.end,
            });
        }
        Ok(Self {
            ratio,
            interval,
            time_range: truncated,
        })
    }

    /// Start of the window a timestamp falls into.
    pub fn window_of(&self, timestamp: i64) -> i64 {
        truncate(timestamp, self.interval.millis())
    }
}

fn truncate(timestamp: i64, window: i64) -> i64 {
    timestamp - timestamp.rem_euclid(window)
}
