//! Data family creation, failed flush recovery, eviction and close.

use lindb::error::Result;
use lindb::filter::{FilterContext, FilterResultSet};
use lindb::interval::{ONE_HOUR, ONE_MINUTE, now_millis};
use lindb::kv::Flusher;
use lindb::memdb::{
    MemoryDatabase, MemoryDatabaseConfig, MemoryDatabaseFactory, MetricRow, default_factory,
};
use lindb::tsdb::{EngineBuilder, FlushableShard};
use lindb::{DatabaseOption, EngineConfig, Field, FieldType, LinDbError, Row, TimeRange};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Memory database whose flush can be switched to fail.
struct FlakyMemDb {
    inner: Arc<dyn MemoryDatabase>,
    fail: Arc<AtomicBool>,
}

impl MemoryDatabase for FlakyMemDb {
    fn family_time(&self) -> i64 {
        self.inner.family_time()
    }
    fn acquire_write(&self) -> Result<()> {
        self.inner.acquire_write()
    }
    fn complete_write(&self) {
        self.inner.complete_write()
    }
    fn write_row(&self, row: &MetricRow) -> Result<()> {
        self.inner.write_row(row)
    }
    fn mark_read_only(&self) {
        self.inner.mark_read_only()
    }
    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }
    fn flush_family_to(&self, flusher: &mut Flusher) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(LinDbError::Other("disk full".into()));
        }
        self.inner.flush_family_to(flusher)
    }
    fn filter(&self, ctx: &FilterContext) -> Result<Vec<Box<dyn FilterResultSet>>> {
        self.inner.filter(ctx)
    }
    fn num_of_series(&self) -> usize {
        self.inner.num_of_series()
    }
    fn num_of_metrics(&self) -> usize {
        self.inner.num_of_metrics()
    }
    fn mem_size(&self) -> usize {
        self.inner.mem_size()
    }
    fn uptime(&self) -> Duration {
        self.inner.uptime()
    }
    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

fn flaky_factory(fail: Arc<AtomicBool>) -> MemoryDatabaseFactory {
    let factory = default_factory();
    Arc::new(move |cfg: MemoryDatabaseConfig| {
        Ok(Arc::new(FlakyMemDb {
            inner: factory(cfg)?,
            fail: Arc::clone(&fail),
        }) as Arc<dyn MemoryDatabase>)
    })
}

fn row(timestamp: i64) -> Row {
    Row::new(
        "cpu",
        timestamp,
        vec![Field::new("usage", FieldType::Sum, 1.0)],
    )
}

#[test]
fn test_families_follow_time_buckets() {
    let dir = TempDir::new().unwrap();
    let engine = EngineBuilder::new(EngineConfig::new(dir.path())).build().unwrap();
    let option = DatabaseOption::default().with_behind(Duration::from_secs(4 * 3600));
    let db = engine.create_database("db", option).unwrap();
    db.create_shards(&[1]).unwrap();
    let shard = db.get_shard(1).unwrap();

    let now = now_millis();
    let old = now - 3 * ONE_HOUR;
    shard.write_rows(&[row(old), row(now)]).unwrap();
    assert_eq!(shard.loaded_families().len(), 2);
    assert_eq!(engine.family_manager().len(), 2);

    let families = shard
        .get_data_families(&TimeRange::new(old, old + ONE_MINUTE))
        .unwrap();
    assert_eq!(families.len(), 1);
    assert!(families[0].time_range().contains(old));
    assert!(families[0].indicator().starts_with("db/1/"));

    // both families were just used
    assert_eq!(engine.evict_families(), 0);

    engine.close().unwrap();
    assert!(engine.family_manager().is_empty());
}

#[test]
fn test_failed_flush_keeps_data_and_retries() {
    let dir = TempDir::new().unwrap();
    let fail = Arc::new(AtomicBool::new(true));
    let engine = EngineBuilder::new(EngineConfig::new(dir.path()))
        .with_memdb_factory(flaky_factory(Arc::clone(&fail)))
        .build()
        .unwrap();
    let db = engine
        .create_database("db", DatabaseOption::default())
        .unwrap();
    db.create_shards(&[1]).unwrap();
    let shard = db.get_shard(1).unwrap();
    let now = now_millis();
    shard.write_rows(&[row(now - ONE_MINUTE)]).unwrap();

    assert!(shard.flush().is_err());
    let family = shard.loaded_families().pop().unwrap();
    assert!(family.has_pending_immutable());
    assert!(family.has_memory_data());
    assert!(shard.need_flush());
    assert!(!family.is_flushing());
    assert_eq!(family.statistics().snapshot().flush_failures, 1);

    // the retained buffer is still readable
    let metric_id = db.index().get_metric_id("cpu").unwrap();
    let series = db.index().find_series_ids(metric_id, |_| true);
    let ctx = FilterContext::new(
        metric_id,
        series.clone(),
        Vec::new(),
        TimeRange::new(now - ONE_HOUR, now),
    );
    let loaded: usize = family
        .filter(&ctx)
        .unwrap()
        .iter()
        .map(|rs| rs.load(&series).unwrap().len())
        .sum();
    assert_eq!(loaded, 1);

    // new writes go to a fresh mutable buffer
    shard.write_rows(&[row(now - ONE_MINUTE)]).unwrap();

    fail.store(false, Ordering::SeqCst);
    shard.flush().unwrap();
    assert!(!family.has_pending_immutable());
    // the retry flushed the retained buffer; the new one follows on the next flush
    if family.has_memory_data() {
        shard.flush().unwrap();
    }
    assert!(!family.has_memory_data());
    engine.close().unwrap();
}

#[test]
fn test_close_flushes_and_unregisters() {
    let dir = TempDir::new().unwrap();
    let engine = EngineBuilder::new(EngineConfig::new(dir.path())).build().unwrap();
    let db = engine
        .create_database("db", DatabaseOption::default())
        .unwrap();
    db.create_shards(&[1, 2]).unwrap();
    let now = now_millis();
    for id in [1, 2] {
        db.get_shard(id).unwrap().write_rows(&[row(now)]).unwrap();
    }
    assert_eq!(engine.family_manager().len(), 2);
    let families = db.get_shard(1).unwrap().loaded_families();

    engine.close().unwrap();
    assert!(engine.family_manager().is_empty());
    assert!(engine.shard_manager().is_empty());
    assert!(families.iter().all(|f| f.is_closed() && !f.has_memory_data()));
}
