//! Memory database: the in-memory write buffer of one data family.
//!
//! Rows are aggregated into storage-interval slots as they arrive. A memory
//! database moves through `writable -> read only -> closed`; once read only no
//! new write lease is granted, and a flush waits for outstanding leases before
//! encoding its data into a kv flusher.

mod block;

pub use block::{FieldBlock, MetricBlock, MetricBlockMerger, SeriesBlock};

use crate::filter::{FilterContext, FilterResultSet, SeriesData};
use crate::interval::{Interval, TimeRange};
use crate::kv::Flusher;
use crate::{Field, LinDbError, Result};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const SERIES_OVERHEAD: usize = 64;
const FIELD_OVERHEAD: usize = 48;
const SLOT_SIZE: usize = 16;

/// A row whose metric and series have been resolved to ids.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub metric_id: u32,
    pub series_id: u32,
    pub timestamp: i64,
    pub fields: Vec<Field>,
}

/// Operations the data family needs from its write buffer.
pub trait MemoryDatabase: Send + Sync {
    /// Start time of the family the database buffers.
    fn family_time(&self) -> i64;

    /// Takes a write lease; fails once the database is read only.
    fn acquire_write(&self) -> Result<()>;

    /// Returns a write lease.
    fn complete_write(&self);

    /// Writes one row. Callers hold a write lease.
    fn write_row(&self, row: &MetricRow) -> Result<()>;

    /// Stops granting write leases.
    fn mark_read_only(&self);

    fn is_read_only(&self) -> bool;

    /// Waits for outstanding write leases, then adds every metric to the flusher.
    fn flush_family_to(&self, flusher: &mut Flusher) -> Result<()>;

    /// Matches buffered data against a query.
    fn filter(&self, ctx: &FilterContext) -> Result<Vec<Box<dyn FilterResultSet>>>;

    fn num_of_series(&self) -> usize;

    fn num_of_metrics(&self) -> usize;

    /// Approximate heap size in bytes.
    fn mem_size(&self) -> usize;

    /// Time since creation.
    fn uptime(&self) -> Duration;

    fn close(&self) -> Result<()>;
}

/// Settings of one memory database.
#[derive(Debug, Clone)]
pub struct MemoryDatabaseConfig {
    pub family_time: i64,
    pub family_range: TimeRange,
    pub interval: Interval,
    pub name: String,
}

/// Creates memory databases for a family.
pub type MemoryDatabaseFactory =
    Arc<dyn Fn(MemoryDatabaseConfig) -> Result<Arc<dyn MemoryDatabase>> + Send + Sync>;

/// The default factory building [`MemoryDb`]s.
pub fn default_factory() -> MemoryDatabaseFactory {
    Arc::new(|cfg| Ok(Arc::new(MemoryDb::new(cfg)) as Arc<dyn MemoryDatabase>))
}

type SeriesMap = HashMap<u32, SeriesBlock>;

/// Buffered series of one metric.
#[derive(Default)]
struct MetricStore {
    series: RwLock<SeriesMap>,
}

/// Heap-backed memory database.
pub struct MemoryDb {
    cfg: MemoryDatabaseConfig,
    created_at: Instant,
    metrics: DashMap<u32, Arc<MetricStore>>,
    num_series: AtomicUsize,
    mem_size: AtomicUsize,
    read_only: AtomicBool,
    closed: AtomicBool,
    writers: Mutex<usize>,
    writers_done: Condvar,
}

impl MemoryDb {
    pub fn new(cfg: MemoryDatabaseConfig) -> Self {
        Self {
            cfg,
            created_at: Instant::now(),
            metrics: DashMap::new(),
            num_series: AtomicUsize::new(0),
            mem_size: AtomicUsize::new(0),
            read_only: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            writers: Mutex::new(0),
            writers_done: Condvar::new(),
        }
    }

    fn get_or_create_metric(&self, metric_id: u32) -> Arc<MetricStore> {
        self.metrics
            .entry(metric_id)
            .or_insert_with(|| Arc::new(MetricStore::default()))
            .clone()
    }

    fn wait_for_writers(&self) {
        let mut writers = self.writers.lock();
        while *writers > 0 {
            self.writers_done.wait(&mut writers);
        }
    }
}

impl MemoryDatabase for MemoryDb {
    fn family_time(&self) -> i64 {
        self.cfg.family_time
    }

    fn acquire_write(&self) -> Result<()> {
        let mut writers = self.writers.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(LinDbError::MemoryDatabaseClosed);
        }
        if self.read_only.load(Ordering::Acquire) {
            return Err(LinDbError::MemoryDatabaseReadOnly);
        }
        *writers += 1;
        Ok(())
    }

    fn complete_write(&self) {
        let mut writers = self.writers.lock();
        *writers = writers.saturating_sub(1);
        if *writers == 0 {
            self.writers_done.notify_all();
        }
    }

    fn write_row(&self, row: &MetricRow) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinDbError::MemoryDatabaseClosed);
        }
        if !self.cfg.family_range.contains(row.timestamp) {
            return Err(LinDbError::OutOfWritableWindow {
                timestamp: row.timestamp,
                min: self.cfg.family_range.start,
                max: self.cfg.family_range.end,
            });
        }

        let slot = self.cfg.interval.slot(self.cfg.family_time, row.timestamp);
        let metric = self.get_or_create_metric(row.metric_id);
        let mut series_map = metric.series.write();

        let mut added = 0usize;
        let series = series_map.entry(row.series_id).or_insert_with(|| {
            self.num_series.fetch_add(1, Ordering::AcqRel);
            added += SERIES_OVERHEAD;
            SeriesBlock::default()
        });

        for field in &row.fields {
            if !field.value.is_finite() {
                continue;
            }
            let block = series.fields.entry(field.name.clone()).or_insert_with(|| {
                added += FIELD_OVERHEAD + field.name.len();
                FieldBlock::new(field.field_type)
            });
            if block.put(slot, field.value) {
                added += SLOT_SIZE;
            }
        }
        drop(series_map);

        if added > 0 {
            self.mem_size.fetch_add(added, Ordering::AcqRel);
        }
        Ok(())
    }

    fn mark_read_only(&self) {
        let _writers = self.writers.lock();
        self.read_only.store(true, Ordering::Release);
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn flush_family_to(&self, flusher: &mut Flusher) -> Result<()> {
        self.wait_for_writers();

        let mut metric_ids: Vec<u32> = self.metrics.iter().map(|e| *e.key()).collect();
        metric_ids.sort_unstable();

        for metric_id in metric_ids {
            let Some(metric) = self.metrics.get(&metric_id).map(|m| Arc::clone(m.value())) else {
                continue;
            };
            let series = metric.series.read();
            if series.is_empty() {
                continue;
            }
            let block = MetricBlock {
                family_time: self.cfg.family_time,
                series: series.iter().map(|(id, s)| (*id, s.clone())).collect(),
            };
            flusher.add(metric_id, block.encode()?);
        }

        tracing::debug!(
            memdb = %self.cfg.name,
            metrics = self.num_of_metrics(),
            series = self.num_of_series(),
            "Flushed memory database"
        );
        Ok(())
    }

    fn filter(&self, ctx: &FilterContext) -> Result<Vec<Box<dyn FilterResultSet>>> {
        let Some((low, high)) = ctx.slot_range(&self.cfg.family_range, self.cfg.interval) else {
            return Ok(Vec::new());
        };
        let Some(metric) = self.metrics.get(&ctx.metric_id).map(|m| Arc::clone(m.value())) else {
            return Ok(Vec::new());
        };

        let series_ids: Vec<u32> = {
            let series = metric.series.read();
            let mut ids: Vec<u32> = ctx
                .series_ids
                .iter()
                .copied()
                .filter(|id| series.contains_key(id))
                .collect();
            ids.sort_unstable();
            ids
        };
        if series_ids.is_empty() {
            return Ok(Vec::new());
        }

        Ok(vec![Box::new(MemoryFilterResultSet {
            name: self.cfg.name.clone(),
            family_time: self.cfg.family_time,
            interval: self.cfg.interval,
            metric,
            series_ids,
            fields: ctx.fields.clone(),
            low,
            high,
        })])
    }

    fn num_of_series(&self) -> usize {
        self.num_series.load(Ordering::Acquire)
    }

    fn num_of_metrics(&self) -> usize {
        self.metrics.len()
    }

    fn mem_size(&self) -> usize {
        self.mem_size.load(Ordering::Acquire)
    }

    fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn close(&self) -> Result<()> {
        {
            let _writers = self.writers.lock();
            self.read_only.store(true, Ordering::Release);
            self.closed.store(true, Ordering::Release);
        }
        self.wait_for_writers();
        self.metrics.clear();
        self.mem_size.store(0, Ordering::Release);
        Ok(())
    }
}

struct MemoryFilterResultSet {
    name: String,
    family_time: i64,
    interval: Interval,
    metric: Arc<MetricStore>,
    series_ids: Vec<u32>,
    fields: Vec<String>,
    low: u16,
    high: u16,
}

impl FilterResultSet for MemoryFilterResultSet {
    fn identifier(&self) -> String {
        format!("memory/{}", self.name)
    }

    fn family_time(&self) -> i64 {
        self.family_time
    }

    fn series_ids(&self) -> &[u32] {
        &self.series_ids
    }

    fn load(&self, series_ids: &[u32]) -> Result<Vec<SeriesData>> {
        let wants_field =
            |name: &str| self.fields.is_empty() || self.fields.iter().any(|f| f == name);
        let series = self.metric.series.read();
        Ok(series_ids
            .iter()
            .filter_map(|id| {
                let block = series.get(id)?.select(wants_field, self.low, self.high);
                (!block.is_empty()).then_some(SeriesData {
                    series_id: *id,
                    family_time: self.family_time,
                    interval: self.interval,
                    block,
                })
            })
            .collect())
    }
}
