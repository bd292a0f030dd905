//! Engine and database configuration.

use crate::interval::{Interval, ONE_HOUR, ONE_SECOND};
use crate::{LinDbError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Worker counts of the three query stage pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPoolConfig {
    pub filtering: usize,
    pub grouping: usize,
    pub scanner: usize,
}

impl Default for QueryPoolConfig {
    fn default() -> Self {
        let cpus = crate::cgroup::available_cpus();
        Self {
            filtering: cpus,
            grouping: (cpus / 2).max(1),
            scanner: cpus,
        }
    }
}

/// Storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Tick of the flush checker.
    pub flush_interval: Duration,
    /// Number of flush workers.
    pub flush_concurrency: usize,
    /// Max age of a mutable memory database before it is flushed.
    pub mutable_memdb_ttl: Duration,
    /// Max heap size of a mutable memory database before it is flushed.
    pub max_memdb_size: usize,
    /// Ratio of used system memory that triggers a watermark flush.
    pub max_mem_usage_before_flush: f64,
    /// Tick of the family janitor.
    pub ttl_check_interval: Duration,
    pub query_pool: QueryPoolConfig,
    /// Capacity of the per-flow field aggregator free list.
    pub aggregator_pool_size: usize,
    /// Table count of a family's kv store that gets compacted after a flush.
    pub compact_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            flush_interval: Duration::from_secs(10),
            flush_concurrency: (crate::cgroup::default_workers_limit() / 2).max(1),
            mutable_memdb_ttl: Duration::from_secs(30 * 60),
            max_memdb_size: 500 * 1024 * 1024,
            max_mem_usage_before_flush: 0.75,
            ttl_check_interval: Duration::from_secs(60),
            query_pool: QueryPoolConfig::default(),
            aggregator_pool_size: 64,
            compact_threshold: 4,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration rooted at the given data directory.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_flush_concurrency(mut self, concurrency: usize) -> Self {
        self.flush_concurrency = concurrency;
        self
    }

    pub fn with_mutable_memdb_ttl(mut self, ttl: Duration) -> Self {
        self.mutable_memdb_ttl = ttl;
        self
    }

    pub fn with_max_memdb_size(mut self, size: usize) -> Self {
        self.max_memdb_size = size;
        self
    }

    pub fn with_max_mem_usage_before_flush(mut self, ratio: f64) -> Self {
        self.max_mem_usage_before_flush = ratio;
        self
    }

    pub fn with_ttl_check_interval(mut self, interval: Duration) -> Self {
        self.ttl_check_interval = interval;
        self
    }

    pub fn with_query_pool(mut self, pool: QueryPoolConfig) -> Self {
        self.query_pool = pool;
        self
    }

    pub fn with_aggregator_pool_size(mut self, size: usize) -> Self {
        self.aggregator_pool_size = size;
        self
    }

    pub fn with_compact_threshold(mut self, tables: usize) -> Self {
        self.compact_threshold = tables;
        self
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval.is_zero() {
            return Err(LinDbError::InvalidConfiguration(
                "flush interval must be positive".to_string(),
            ));
        }
        if self.ttl_check_interval.is_zero() {
            return Err(LinDbError::InvalidConfiguration(
                "ttl check interval must be positive".to_string(),
            ));
        }
        if !(self.max_mem_usage_before_flush > 0.0 && self.max_mem_usage_before_flush <= 1.0) {
            return Err(LinDbError::InvalidConfiguration(format!(
                "max memory usage before flush must be in (0, 1], got {}",
                self.max_mem_usage_before_flush
            )));
        }
        if self.max_memdb_size == 0 {
            return Err(LinDbError::InvalidConfiguration(
                "max memory database size must be positive".to_string(),
            ));
        }
        if self.compact_threshold < 2 {
            return Err(LinDbError::InvalidConfiguration(format!(
                "compact threshold must be at least 2 tables, got {}",
                self.compact_threshold
            )));
        }
        Ok(())
    }
}

/// Per-database storage options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseOption {
    /// Storage interval first, rollup intervals after it.
    pub intervals: Vec<Interval>,
    /// How far into the future a write may land, in milliseconds.
    pub ahead: i64,
    /// How far into the past a write may land, in milliseconds.
    pub behind: i64,
}

impl Default for DatabaseOption {
    fn default() -> Self {
        Self {
            intervals: vec![Interval::from_secs(10)],
            ahead: ONE_HOUR,
            behind: ONE_HOUR,
        }
    }
}

impl DatabaseOption {
    pub fn with_intervals(mut self, intervals: Vec<Interval>) -> Self {
        self.intervals = intervals;
        self
    }

    pub fn with_ahead(mut self, ahead: Duration) -> Self {
        self.ahead = ahead.as_millis() as i64;
        self
    }

    pub fn with_behind(mut self, behind: Duration) -> Self {
        self.behind = behind.as_millis() as i64;
        self
    }

    /// The interval rows are written with.
    pub fn write_interval(&self) -> Interval {
        self.intervals
            .first()
            .copied()
            .unwrap_or(Interval::from_secs(10))
    }

    /// Smallest rollup interval, present only with more than one interval.
    pub fn smallest_rollup_interval(&self) -> Option<Interval> {
        if self.intervals.len() <= 1 {
            return None;
        }
        self.intervals[1..].iter().min().copied()
    }

    pub fn validate(&self) -> Result<()> {
        if self.intervals.is_empty() {
            return Err(LinDbError::InvalidConfiguration(
                "database needs at least one interval".to_string(),
            ));
        }
        if self.ahead < 0 || self.behind < 0 {
            return Err(LinDbError::InvalidConfiguration(
                "writable window must not be negative".to_string(),
            ));
        }
        if self.write_interval().millis() < ONE_SECOND {
            return Err(LinDbError::InvalidConfiguration(
                "storage interval must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}
