//! lindb - storage core of a distributed time-series database
//!
//! Rows are written into data families (one per shard, interval and time
//! bucket), buffered in memory databases and flushed into per-segment kv
//! stores by a background checker. Queries run as a root/intermediate/leaf
//! task tree whose leaves scan local families in staged worker pools.

pub mod cgroup;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod filter;
pub mod index;
pub mod interval;
pub mod kv;
pub mod memdb;
pub mod metrics;
pub mod query;
pub mod rpc;
pub mod tag;
pub mod tsdb;

pub use config::{DatabaseOption, EngineConfig};
pub use error::{LinDbError, Result};
pub use interval::{Interval, IntervalType, TimeRange};
pub use tag::Tag;
pub use tsdb::{DataFamily, DataFlushChecker, Engine, FamilyManager, Shard, ShardManager};

use serde::{Deserialize, Serialize};
use std::fmt;

/// How values landing in the same slot are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Sum,
    Min,
    Max,
    Last,
    First,
}

impl FieldType {
    /// Merges a new value into an existing one.
    pub fn merge(self, old: f64, new: f64) -> f64 {
        match self {
            FieldType::Sum => old + new,
            FieldType::Min => old.min(new),
            FieldType::Max => old.max(new),
            FieldType::Last => new,
            FieldType::First => old,
        }
    }
}

/// One named value of a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub value: f64,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType, value: f64) -> Self {
        Self {
            name: name.into(),
            field_type,
            value,
        }
    }
}

/// A row includes the fields of one series at one timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    metric: String,
    tags: Vec<Tag>,
    timestamp: i64,
    fields: Vec<Field>,
}

impl Row {
    /// Creates a new row without tags.
    pub fn new(metric: impl Into<String>, timestamp: i64, fields: Vec<Field>) -> Self {
        Self {
            metric: metric.into(),
            tags: Vec::new(),
            timestamp,
            fields,
        }
    }

    /// Creates a new row with tags.
    pub fn with_tags(
        metric: impl Into<String>,
        tags: Vec<Tag>,
        timestamp: i64,
        fields: Vec<Field>,
    ) -> Self {
        Self {
            metric: metric.into(),
            tags,
            timestamp,
            fields,
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Unix timestamp in milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Row({}{{{}}} ts: {}, fields: {})",
            self.metric,
            tag::series_key(&self.tags),
            self.timestamp,
            self.fields.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_type_merge() {
        assert_eq!(FieldType::Sum.merge(1.0, 2.0), 3.0);
        assert_eq!(FieldType::Min.merge(1.0, 2.0), 1.0);
        assert_eq!(FieldType::Max.merge(1.0, 2.0), 2.0);
        assert_eq!(FieldType::Last.merge(1.0, 2.0), 2.0);
        assert_eq!(FieldType::First.merge(1.0, 2.0), 1.0);
    }

    #[test]
    fn row_display_uses_series_key() {
        let row = Row::with_tags(
            "cpu",
            vec![Tag::new("host", "a"), Tag::new("dc", "x")],
            10,
            vec![Field::new("usage", FieldType::Last, 0.5)],
        );
        assert_eq!(row.to_string(), "Row(cpu{dc=x,host=a} ts: 10, fields: 1)");
    }
}
