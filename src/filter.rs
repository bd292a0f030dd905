//! Filtering contract shared by memory and file data of a family.

use crate::interval::{Interval, TimeRange};
use crate::memdb::SeriesBlock;
use crate::Result;

/// What a query asks a family for.
#[derive(Debug, Clone)]
pub struct FilterContext {
    pub metric_id: u32,
    /// Sorted, deduplicated series ids that passed the tag filter.
    pub series_ids: Vec<u32>,
    /// Field names to load; empty loads every field.
    pub fields: Vec<String>,
    pub time_range: TimeRange,
}

impl FilterContext {
    pub fn new(metric_id: u32, mut series_ids: Vec<u32>, fields: Vec<String>, time_range: TimeRange) -> Self {
        series_ids.sort_unstable();
        series_ids.dedup();
        Self {
            metric_id,
            series_ids,
            fields,
            time_range,
        }
    }

    pub fn wants_series(&self, series_id: u32) -> bool {
        self.series_ids.binary_search(&series_id).is_ok()
    }

    pub fn wants_field(&self, name: &str) -> bool {
        self.fields.is_empty() || self.fields.iter().any(|f| f == name)
    }

    /// Slot bounds (inclusive) of the query range inside one family.
    pub fn slot_range(&self, family_range: &TimeRange, interval: Interval) -> Option<(u16, u16)> {
        let overlap = self.time_range.intersect(family_range)?;
        Some((
            interval.slot(family_range.start, overlap.start),
            interval.slot(family_range.start, overlap.end),
        ))
    }
}

/// Data of one series loaded by a filter result set.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesData {
    pub series_id: u32,
    pub family_time: i64,
    pub interval: Interval,
    pub block: SeriesBlock,
}

/// A lazily loadable match of a family's memory or file data.
pub trait FilterResultSet: Send + Sync {
    /// Where the data comes from, for logging.
    fn identifier(&self) -> String;

    fn family_time(&self) -> i64;

    /// Series ids that have data in this result set.
    fn series_ids(&self) -> &[u32];

    /// Loads the requested fields of the given series within the query range.
    fn load(&self, series_ids: &[u32]) -> Result<Vec<SeriesData>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_normalises_series_ids() {
        let ctx = FilterContext::new(1, vec![5, 1, 5, 3], Vec::new(), TimeRange::new(0, 10));
        assert_eq!(ctx.series_ids, vec![1, 3, 5]);
        assert!(ctx.wants_series(3));
        assert!(!ctx.wants_series(2));
        assert!(ctx.wants_field("anything"));
    }

    #[test]
    fn slot_range_clips_to_family() {
        let interval = Interval::from_secs(10);
        let ctx = FilterContext::new(1, vec![1], vec!["f".into()], TimeRange::new(35_000, 65_000));
        let family = TimeRange::new(0, 3_600_000 - 1);
        assert_eq!(ctx.slot_range(&family, interval), Some((3, 6)));
        assert!(!ctx.wants_field("g"));

        let later = TimeRange::new(3_600_000, 7_200_000 - 1);
        assert_eq!(ctx.slot_range(&later, interval), None);
    }
}
