//! Per-series field aggregation into down-sampling windows.

use super::downsampling::DownSampling;
use super::model::FieldPoints;
use crate::interval::Interval;
use crate::memdb::FieldBlock;

/// Folds the slots of one field of one series into query windows.
/// Instances are pooled by the query flow and reset between uses.
#[derive(Debug, Default)]
pub struct FieldAggregator {
    points: FieldPoints,
}

impl FieldAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every slot of `block` that falls inside the query range.
    pub fn aggregate(
        &mut self,
        ds: &DownSampling,
        family_time: i64,
        interval: Interval,
        block: &FieldBlock,
    ) {
        for (slot, value) in &block.slots {
            let timestamp = interval.slot_time(family_time, *slot);
            if !ds.time_range.contains(timestamp) {
                continue;
            }
            self.points.entry(ds.window_of(timestamp)).or_default().add(*value);
        }
    }

    pub fn points(&self) -> &FieldPoints {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn reset(&mut self) {
        self.points.clear();
    }
}
