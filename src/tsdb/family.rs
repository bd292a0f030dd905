//! Data family: the write/read unit of one shard, interval and time bucket.
//!
//! A family owns a mutable memory database that takes writes and, while a
//! flush is in flight, an immutable one being persisted into the family's kv
//! store. Replica sequences are tracked per leader: `seq` is what has been
//! written, `persist_seq` what has been made durable by a flush.

use super::StorageContext;
use super::segment::DataSegment;
use crate::filter::{FilterContext, FilterResultSet, SeriesData};
use crate::interval::{Interval, TimeRange, ONE_MINUTE, now_millis};
use crate::kv::{self, Reader, Snapshot};
use crate::memdb::{MemoryDatabase, MemoryDatabaseConfig, MetricBlock, MetricRow};
use crate::metrics::FamilyStatistics;
use crate::{LinDbError, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// A family not read for this long may be evicted.
pub const IDLE_READ_THRESHOLD: i64 = 30 * ONE_MINUTE;

/// Observer of persisted sequences of one leader.
pub type AckCallback = Arc<dyn Fn(i64) + Send + Sync>;

#[derive(Default)]
struct FamilyState {
    mutable: Option<Arc<dyn MemoryDatabase>>,
    immutable: Option<Arc<dyn MemoryDatabase>>,
    seq: HashMap<i32, i64>,
    immutable_seq: HashMap<i32, i64>,
    persist_seq: HashMap<i32, i64>,
    callbacks: HashMap<i32, Vec<AckCallback>>,
}

/// One storage unit per (shard, interval, time bucket).
pub struct DataFamily {
    indicator: String,
    interval: Interval,
    time_range: TimeRange,
    family_time: i64,
    kv_family: Arc<kv::Family>,
    ctx: StorageContext,
    segment: Weak<DataSegment>,

    state: Mutex<FamilyState>,
    /// Readers capture tables and buffers under the read side; a flush
    /// publishes its table and drops its buffer under the write side.
    version: RwLock<()>,
    is_flushing: AtomicBool,
    flush_gate: Mutex<()>,
    flush_done: Condvar,
    refs: AtomicUsize,
    closed: AtomicBool,
    last_read_time: AtomicI64,
    last_flush_time: AtomicI64,
    stats: FamilyStatistics,
}

impl DataFamily {
    /// Creates a family over its kv family and registers it with the family
    /// manager. Replica sequences already persisted in the kv family become
    /// both the committed and the persisted sequences.
    pub fn open(
        ctx: StorageContext,
        indicator: impl Into<String>,
        interval: Interval,
        time_range: TimeRange,
        kv_family: Arc<kv::Family>,
        segment: Weak<DataSegment>,
    ) -> Arc<Self> {
        let persisted = kv_family.sequences();
        let now = now_millis();
        let family = Arc::new(Self {
            indicator: indicator.into(),
            interval,
            time_range,
            family_time: time_range.start,
            kv_family,
            segment,
            state: Mutex::new(FamilyState {
                seq: persisted.clone(),
                persist_seq: persisted,
                ..Default::default()
            }),
            version: RwLock::new(()),
            is_flushing: AtomicBool::new(false),
            flush_gate: Mutex::new(()),
            flush_done: Condvar::new(),
            refs: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            last_read_time: AtomicI64::new(now),
            last_flush_time: AtomicI64::new(now),
            stats: FamilyStatistics::default(),
            ctx,
        });
        family.ctx.family_manager.add(Arc::clone(&family));
        debug!(family = %family.indicator, "Opened data family");
        family
    }

    /// Stable key: `database/shard/interval/family-time`.
    pub fn indicator(&self) -> &str {
        &self.indicator
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    pub fn family_time(&self) -> i64 {
        self.family_time
    }

    pub fn statistics(&self) -> &FamilyStatistics {
        &self.stats
    }

    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release(&self) {
        let _ = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1));
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Gets the mutable memory database, creating it on first write, and takes
    /// a write lease on it while holding the state lock so a concurrent flush
    /// cannot swap it out between the two.
    fn acquire_mutable(&self) -> Result<Arc<dyn MemoryDatabase>> {
        let mut state = self.state.lock();
        let db = match &state.mutable {
            Some(db) => Arc::clone(db),
            None => {
                let cfg = MemoryDatabaseConfig {
                    family_time: self.family_time,
                    family_range: self.time_range,
                    interval: self.interval,
                    name: self.indicator.clone(),
                };
                let db = (self.ctx.memdb_factory)(cfg).inspect_err(|e| {
                    self.stats.memdb_create_failures.fetch_add(1, Ordering::Relaxed);
                    error!(family = %self.indicator, error = %e, "Failed to create memory database");
                })?;
                state.mutable = Some(Arc::clone(&db));
                db
            }
        };
        db.acquire_write()?;
        Ok(db)
    }

    /// Writes rows into the mutable memory database. Per-row failures are
    /// counted, not returned; only failing to obtain the database is an error.
    pub fn write_rows(&self, rows: &[MetricRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(LinDbError::MemoryDatabaseClosed);
        }

        self.retain();
        let result = self.acquire_mutable().map(|db| {
            for row in rows {
                match db.write_row(row) {
                    Ok(()) => {
                        self.stats.write_rows.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.stats.write_row_failures.fetch_add(1, Ordering::Relaxed);
                        debug!(family = %self.indicator, error = %e, "Failed to write row");
                    }
                }
            }
            db.complete_write();
        });
        self.release();
        result
    }

    /// True when `seq` is newer than what was committed for `leader`.
    pub fn validate_sequence(&self, leader: i32, seq: i64) -> bool {
        self.state
            .lock()
            .seq
            .get(&leader)
            .is_none_or(|committed| seq > *committed)
    }

    /// Records `seq` as committed for `leader`. Callers validate first.
    pub fn commit_sequence(&self, leader: i32, seq: i64) {
        self.state.lock().seq.insert(leader, seq);
    }

    pub fn committed_sequence(&self, leader: i32) -> Option<i64> {
        self.state.lock().seq.get(&leader).copied()
    }

    pub fn persisted_sequence(&self, leader: i32) -> Option<i64> {
        self.state.lock().persist_seq.get(&leader).copied()
    }

    /// Registers an observer of persisted sequences for `leader`. When a
    /// sequence was already persisted the observer sees it right away.
    pub fn ack_sequence(&self, leader: i32, callback: impl Fn(i64) + Send + Sync + 'static) {
        let callback: AckCallback = Arc::new(callback);
        let persisted = {
            let mut state = self.state.lock();
            state
                .callbacks
                .entry(leader)
                .or_default()
                .push(Arc::clone(&callback));
            state.persist_seq.get(&leader).copied()
        };
        if let Some(seq) = persisted {
            callback(seq);
        }
    }

    fn mutable_ttl(&self) -> Duration {
        let ttl = self.ctx.config.mutable_memdb_ttl;
        match self.ctx.option.smallest_rollup_interval() {
            Some(rollup) => ttl.min(Duration::from_millis(rollup.millis() as u64)),
            None => ttl,
        }
    }

    /// Whether the mutable memory database should be flushed now.
    pub fn need_flush(&self) -> bool {
        if self.is_flushing.load(Ordering::Acquire) {
            return false;
        }
        let state = self.state.lock();
        if state.immutable.is_some() {
            return false;
        }
        let Some(db) = &state.mutable else {
            return false;
        };
        if db.num_of_metrics() == 0 {
            return false;
        }

        let ttl = self.mutable_ttl();
        let uptime = db.uptime();
        if uptime >= ttl {
            info!(
                family = %self.indicator,
                uptime_ms = uptime.as_millis() as u64,
                ttl_ms = ttl.as_millis() as u64,
                "Memory database reached its TTL"
            );
            return true;
        }
        let size = db.mem_size();
        if size > self.ctx.config.max_memdb_size {
            info!(
                family = %self.indicator,
                mem_size = size,
                max = self.ctx.config.max_memdb_size,
                "Memory database is full"
            );
            return true;
        }
        false
    }

    /// An immutable buffer left behind by a failed flush, waiting for a retry.
    pub fn has_pending_immutable(&self) -> bool {
        !self.is_flushing.load(Ordering::Acquire) && self.state.lock().immutable.is_some()
    }

    /// Whether any buffered data still lives in memory.
    pub fn has_memory_data(&self) -> bool {
        let state = self.state.lock();
        state.mutable.is_some() || state.immutable.is_some()
    }

    pub fn is_flushing(&self) -> bool {
        self.is_flushing.load(Ordering::Acquire)
    }

    /// Heap size of the memory databases.
    pub fn mem_size(&self) -> usize {
        let state = self.state.lock();
        state.mutable.as_ref().map_or(0, |db| db.mem_size())
            + state.immutable.as_ref().map_or(0, |db| db.mem_size())
    }

    /// Flushes buffered data into the kv store. Concurrent callers return
    /// immediately while a flush is running. A retained immutable buffer from
    /// an earlier failure is flushed before the mutable one is rotated.
    #[instrument(skip(self), fields(family = %self.indicator))]
    pub fn flush(&self) -> Result<()> {
        if self
            .is_flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(family = %self.indicator, "Flush already in flight");
            return Ok(());
        }

        let start = Instant::now();
        let result = self.flush_memory_database();
        let elapsed = start.elapsed();

        match &result {
            Ok(true) => {
                self.stats.record_flush(elapsed, true);
                self.last_flush_time.store(now_millis(), Ordering::Release);
                info!(
                    family = %self.indicator,
                    duration_ms = elapsed.as_millis() as u64,
                    "Flushed data family"
                );
                self.compact_if_needed();
            }
            Ok(false) => {}
            Err(e) => {
                self.stats.record_flush(elapsed, false);
                error!(family = %self.indicator, error = %e, "Failed to flush data family");
            }
        }

        {
            let _gate = self.flush_gate.lock();
            self.is_flushing.store(false, Ordering::Release);
            self.flush_done.notify_all();
        }
        result.map(|_| ())
    }

    fn flush_memory_database(&self) -> Result<bool> {
        let (immutable, sequences) = {
            let mut state = self.state.lock();
            match &state.immutable {
                Some(db) => (Arc::clone(db), state.immutable_seq.clone()),
                None => {
                    let Some(db) = state.mutable.take() else {
                        return Ok(false);
                    };
                    db.mark_read_only();
                    state.immutable_seq = state.seq.clone();
                    state.immutable = Some(Arc::clone(&db));
                    (db, state.immutable_seq.clone())
                }
            }
        };

        let mut flusher = self.kv_family.new_flusher();
        for (leader, seq) in &sequences {
            flusher.sequence(*leader, *seq);
        }
        if let Err(e) = immutable.flush_family_to(&mut flusher) {
            flusher.release();
            return Err(e);
        }
        let acks = {
            let _version = self.version.write();
            flusher.commit()?;

            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.immutable = None;
            let flushed = std::mem::take(&mut state.immutable_seq);
            let mut acks = Vec::new();
            for (leader, seq) in flushed {
                let persisted = state.persist_seq.entry(leader).or_insert(seq);
                *persisted = (*persisted).max(seq);
                if let Some(callbacks) = state.callbacks.get(&leader) {
                    acks.extend(callbacks.iter().map(|cb| (Arc::clone(cb), *persisted)));
                }
            }
            acks
        };

        if let Err(e) = immutable.close() {
            warn!(family = %self.indicator, error = %e, "Failed to close flushed memory database");
        }
        for (callback, seq) in acks {
            callback(seq);
        }
        Ok(true)
    }

    /// Merges the kv tables once flushes have piled up enough of them, so a
    /// read decodes a bounded number of tables.
    fn compact_if_needed(&self) {
        let tables = self.kv_family.num_of_tables();
        if tables < self.ctx.config.compact_threshold {
            return;
        }
        match self.kv_family.compact() {
            Ok(_) => {
                self.stats.compactions.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.compaction_failures.fetch_add(1, Ordering::Relaxed);
                warn!(family = %self.indicator, tables, error = %e, "Failed to compact family");
            }
        }
    }

    fn wait_for_flush(&self) {
        let mut gate = self.flush_gate.lock();
        while self.is_flushing.load(Ordering::Acquire) {
            self.flush_done.wait(&mut gate);
        }
    }

    /// Waits for an in-flight flush, flushes whatever is left in memory and
    /// deregisters the family.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        loop {
            self.wait_for_flush();
            if !self.has_memory_data() {
                break;
            }
            self.flush()?;
        }
        self.ctx.family_manager.remove(self);
        debug!(family = %self.indicator, "Closed data family");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Nobody writes to the family, it buffers nothing, its bucket is outside
    /// the ahead window and it has not been read lately.
    pub(crate) fn is_evictable(&self) -> bool {
        if self.ref_count() > 0 || self.is_flushing() || self.has_memory_data() {
            return false;
        }
        let now = now_millis();
        now - self.time_range.end > self.ctx.option.ahead
            && now - self.last_read_time.load(Ordering::Acquire) > IDLE_READ_THRESHOLD
    }

    /// Closes an idle family and removes it from its segment. Returns whether
    /// the family was evicted. The segment drops the family before it is
    /// closed, under the same lock writers retain families with.
    pub fn evict(&self) -> bool {
        if !self.is_evictable() {
            return false;
        }
        let detached = self
            .segment
            .upgrade()
            .is_none_or(|segment| segment.detach_family(self));
        if !detached {
            return false;
        }

        if let Err(e) = self.close() {
            error!(family = %self.indicator, error = %e, "Failed to close evicted family");
            return false;
        }
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        info!(family = %self.indicator, "Evicted idle data family");
        true
    }

    #[cfg(test)]
    pub(crate) fn set_last_read_time(&self, timestamp: i64) {
        self.last_read_time.store(timestamp, Ordering::Release);
    }

    pub fn last_flush_time(&self) -> i64 {
        self.last_flush_time.load(Ordering::Acquire)
    }

    /// Matches file and memory data against a query, oldest data first.
    pub fn filter(&self, ctx: &FilterContext) -> Result<Vec<Box<dyn FilterResultSet>>> {
        self.last_read_time.store(now_millis(), Ordering::Release);
        if !ctx.time_range.overlaps(&self.time_range) {
            return Ok(Vec::new());
        }

        let (snapshot, memory) = {
            let _version = self.version.read();
            let (immutable, mutable) = {
                let state = self.state.lock();
                (state.immutable.clone(), state.mutable.clone())
            };
            let snapshot = self.kv_family.get_snapshot();
            // Memory result sets hold the metric data they matched, so a
            // flush closing the buffer afterwards does not empty them.
            let mut memory = Vec::new();
            for db in immutable.iter().chain(mutable.iter()) {
                memory.extend(db.filter(ctx)?);
            }
            (snapshot, memory)
        };

        let mut result = self.file_filter(ctx, snapshot)?;
        result.extend(memory);
        Ok(result)
    }

    fn file_filter(
        &self,
        ctx: &FilterContext,
        snapshot: Snapshot,
    ) -> Result<Vec<Box<dyn FilterResultSet>>> {
        let readers = snapshot.find_readers(ctx.metric_id);
        snapshot.close();
        if readers.is_empty() {
            return Ok(Vec::new());
        }
        let Some((low, high)) = ctx.slot_range(&self.time_range, self.interval) else {
            return Ok(Vec::new());
        };

        let block = merge_readers(&readers, ctx.metric_id)?;
        let series_ids: Vec<u32> = ctx
            .series_ids
            .iter()
            .copied()
            .filter(|id| block.series.contains_key(id))
            .collect();
        if series_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Box::new(FileFilterResultSet {
            identifier: format!("file/{}", self.indicator),
            family_time: self.family_time,
            interval: self.interval,
            block,
            series_ids,
            fields: ctx.fields.clone(),
            low,
            high,
        })])
    }
}

fn merge_readers(readers: &[Reader], metric_id: u32) -> Result<MetricBlock> {
    let mut merged: Option<MetricBlock> = None;
    for reader in readers {
        let Some(value) = reader.get(metric_id) else {
            continue;
        };
        let block = MetricBlock::decode(value)?;
        match merged.as_mut() {
            Some(m) => m.merge_newer(&block),
            None => merged = Some(block),
        }
    }
    Ok(merged.unwrap_or_default())
}

struct FileFilterResultSet {
    identifier: String,
    family_time: i64,
    interval: Interval,
    block: MetricBlock,
    series_ids: Vec<u32>,
    fields: Vec<String>,
    low: u16,
    high: u16,
}

impl FilterResultSet for FileFilterResultSet {
    fn identifier(&self) -> String {
        self.identifier.clone()
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
        Ok(series_ids
            .iter()
            .filter_map(|id| {
                let block = self.block.series.get(id)?.select(wants_field, self.low, self.high);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseOption, EngineConfig};
    use crate::interval::{ONE_HOUR, ONE_SECOND};
    use crate::memdb::{MemoryDb, MemoryDatabaseFactory, MetricBlockMerger, default_factory};
    use crate::tsdb::FamilyManager;
    use crate::{Field, FieldType};
    use std::sync::atomic::AtomicU64;
    use std::thread;
    use tempfile::TempDir;

    /// Wraps a real memory database to control uptime and flush behaviour.
    struct TestMemDb {
        inner: MemoryDb,
        uptime: Duration,
        mem_size: Option<usize>,
        fail_flush: bool,
        flush_delay: Duration,
        filter_delay: Duration,
        flushes: Arc<AtomicU64>,
    }

    impl MemoryDatabase for TestMemDb {
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
        fn flush_family_to(&self, flusher: &mut kv::Flusher) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.flush_delay);
            if self.fail_flush {
                return Err(LinDbError::Other("disk full".into()));
            }
            self.inner.flush_family_to(flusher)
        }
        fn filter(&self, ctx: &FilterContext) -> Result<Vec<Box<dyn FilterResultSet>>> {
            thread::sleep(self.filter_delay);
            self.inner.filter(ctx)
        }
        fn num_of_series(&self) -> usize {
            self.inner.num_of_series()
        }
        fn num_of_metrics(&self) -> usize {
            self.inner.num_of_metrics()
        }
        fn mem_size(&self) -> usize {
            self.mem_size.unwrap_or_else(|| self.inner.mem_size())
        }
        fn uptime(&self) -> Duration {
            self.uptime
        }
        fn close(&self) -> Result<()> {
            self.inner.close()
        }
    }

    #[derive(Clone, Default)]
    struct Behaviour {
        uptime: Duration,
        mem_size: Option<usize>,
        fail_flush: Arc<AtomicBool>,
        flush_delay: Duration,
        filter_delay: Duration,
        flushes: Arc<AtomicU64>,
    }

    fn factory(b: Behaviour) -> MemoryDatabaseFactory {
        Arc::new(move |cfg| {
            Ok(Arc::new(TestMemDb {
                inner: MemoryDb::new(cfg),
                uptime: b.uptime,
                mem_size: b.mem_size,
                fail_flush: b.fail_flush.load(Ordering::SeqCst),
                flush_delay: b.flush_delay,
                filter_delay: b.filter_delay,
                flushes: Arc::clone(&b.flushes),
            }) as Arc<dyn MemoryDatabase>)
        })
    }

    struct Fixture {
        _dir: TempDir,
        family: Arc<DataFamily>,
        manager: Arc<FamilyManager>,
        kv: Arc<kv::Family>,
    }

    fn fixture_with(
        factory: MemoryDatabaseFactory,
        config: EngineConfig,
        option: DatabaseOption,
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let kv = kv::Family::open("0", dir.path(), Arc::new(MetricBlockMerger)).unwrap();
        let manager = Arc::new(FamilyManager::new());
        let ctx = StorageContext {
            config: Arc::new(config),
            option: Arc::new(option),
            memdb_factory: factory,
            family_manager: Arc::clone(&manager),
        };
        let family = DataFamily::open(
            ctx,
            "db/1/10s/0",
            Interval::from_secs(10),
            TimeRange::new(0, ONE_HOUR - 1),
            Arc::clone(&kv),
            Weak::new(),
        );
        Fixture {
            _dir: dir,
            family,
            manager,
            kv,
        }
    }

    fn fixture(factory: MemoryDatabaseFactory) -> Fixture {
        fixture_with(factory, EngineConfig::default(), DatabaseOption::default())
    }

    fn rows(n: u32) -> Vec<MetricRow> {
        (0..n)
            .map(|i| MetricRow {
                metric_id: 1,
                series_id: i,
                timestamp: 5 * ONE_SECOND,
                fields: vec![Field::new("f", FieldType::Sum, 1.0)],
            })
            .collect()
    }

    #[test]
    fn write_counts_per_row_failures() {
        let f = fixture(default_factory());
        let mut batch = rows(2);
        batch.push(MetricRow {
            metric_id: 1,
            series_id: 9,
            timestamp: ONE_HOUR * 2,
            fields: vec![],
        });
        f.family.write_rows(&batch).unwrap();
        let s = f.family.statistics().snapshot();
        assert_eq!(s.write_rows, 2);
        assert_eq!(s.write_row_failures, 1);
        assert_eq!(f.family.ref_count(), 0);
        assert!(f.manager.get("db/1/10s/0").is_some());
    }

    #[test]
    fn memdb_creation_failure_is_returned() {
        let factory: MemoryDatabaseFactory =
            Arc::new(|_| Err(LinDbError::Other("no memory".into())));
        let f = fixture(factory);
        assert!(f.family.write_rows(&rows(1)).is_err());
        assert_eq!(f.family.statistics().snapshot().memdb_create_failures, 1);
    }

    #[test]
    fn sequences_are_monotonic() {
        let f = fixture(default_factory());
        assert!(f.family.validate_sequence(1, 0));
        f.family.commit_sequence(1, 5);
        f.family.commit_sequence(1, 8);
        assert!(!f.family.validate_sequence(1, 8));
        assert!(!f.family.validate_sequence(1, 6));
        assert!(f.family.validate_sequence(1, 9));
        assert!(f.family.validate_sequence(2, 1));
    }

    #[test]
    fn ack_callback_fires_on_flush_and_on_registration() {
        let f = fixture(default_factory());
        let seen = Arc::new(AtomicI64::new(-1));
        let s = Arc::clone(&seen);
        f.family.ack_sequence(1, move |seq| s.store(seq, Ordering::SeqCst));
        assert_eq!(seen.load(Ordering::SeqCst), -1);

        f.family.write_rows(&rows(1)).unwrap();
        f.family.commit_sequence(1, 10);
        f.family.flush().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 10);
        assert_eq!(f.family.persisted_sequence(1), Some(10));

        let late = Arc::new(AtomicI64::new(-1));
        let l = Arc::clone(&late);
        f.family.ack_sequence(1, move |seq| l.store(seq, Ordering::SeqCst));
        assert_eq!(late.load(Ordering::SeqCst), 10);
        assert_eq!(f.kv.sequences().get(&1), Some(&10));
    }

    #[test]
    fn need_flush_at_ttl_boundary() {
        let ttl = Duration::from_secs(60);
        let config = EngineConfig::default().with_mutable_memdb_ttl(ttl);
        let f = fixture_with(
            factory(Behaviour {
                uptime: ttl,
                ..Default::default()
            }),
            config.clone(),
            DatabaseOption::default(),
        );
        assert!(!f.family.need_flush());
        f.family.write_rows(&rows(1)).unwrap();
        assert!(f.family.need_flush());

        let f = fixture_with(
            factory(Behaviour {
                uptime: ttl - Duration::from_millis(1),
                ..Default::default()
            }),
            config,
            DatabaseOption::default(),
        );
        f.family.write_rows(&rows(1)).unwrap();
        assert!(!f.family.need_flush());
    }

    #[test]
    fn need_flush_on_size_and_rollup_cap() {
        let config = EngineConfig::default().with_max_memdb_size(100);
        let f = fixture_with(
            factory(Behaviour {
                mem_size: Some(101),
                ..Default::default()
            }),
            config,
            DatabaseOption::default(),
        );
        f.family.write_rows(&rows(1)).unwrap();
        assert!(f.family.need_flush());

        let option = DatabaseOption::default()
            .with_intervals(vec![Interval::from_secs(10), Interval::from_secs(300)]);
        let f = fixture_with(
            factory(Behaviour {
                uptime: Duration::from_secs(300),
                ..Default::default()
            }),
            EngineConfig::default(),
            option,
        );
        f.family.write_rows(&rows(1)).unwrap();
        assert!(f.family.need_flush());
    }

    #[test]
    fn concurrent_flush_is_single_flight() {
        let behaviour = Behaviour {
            flush_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let flushes = Arc::clone(&behaviour.flushes);
        let f = fixture(factory(behaviour));
        f.family.write_rows(&rows(4)).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let family = Arc::clone(&f.family);
                thread::spawn(move || family.flush())
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        assert_eq!(f.family.statistics().snapshot().flushes, 1);
        assert_eq!(f.kv.num_of_tables(), 1);
    }

    #[test]
    fn failed_flush_keeps_immutable_for_retry() {
        let behaviour = Behaviour::default();
        behaviour.fail_flush.store(true, Ordering::SeqCst);
        let fail = Arc::clone(&behaviour.fail_flush);
        let f = fixture(factory(behaviour));

        f.family.write_rows(&rows(2)).unwrap();
        assert!(f.family.flush().is_err());
        assert!(f.family.has_pending_immutable());
        assert!(!f.family.need_flush());

        // Writes keep landing in a fresh mutable buffer.
        fail.store(false, Ordering::SeqCst);
        f.family.write_rows(&rows(3)).unwrap();

        // The first memdb was created failing, so the retry fails again.
        assert!(f.family.flush().is_err());
        assert_eq!(f.family.statistics().snapshot().flush_failures, 2);
        assert!(f.family.has_memory_data());
    }

    #[test]
    fn flush_then_filter_reads_file_and_memory() {
        let f = fixture(default_factory());
        f.family.write_rows(&rows(2)).unwrap();
        f.family.flush().unwrap();
        assert!(!f.family.has_memory_data());
        f.family.write_rows(&rows(3)).unwrap();

        let ctx = FilterContext::new(1, vec![0, 1, 2], vec![], TimeRange::new(0, ONE_HOUR));
        let result = f.family.filter(&ctx).unwrap();
        assert_eq!(result.len(), 2);
        assert!(result[0].identifier().starts_with("file/"));
        assert_eq!(result[0].series_ids(), &[0, 1]);
        assert_eq!(result[1].series_ids(), &[0, 1, 2]);

        let outside = FilterContext::new(1, vec![0], vec![], TimeRange::new(ONE_HOUR, 2 * ONE_HOUR));
        assert!(f.family.filter(&outside).unwrap().is_empty());
    }

    #[test]
    fn filter_sees_data_flushed_while_reading() {
        let f = fixture(factory(Behaviour {
            filter_delay: Duration::from_millis(100),
            ..Default::default()
        }));
        f.family.write_rows(&rows(3)).unwrap();

        let family = Arc::clone(&f.family);
        let reader = thread::spawn(move || {
            let ctx = FilterContext::new(1, vec![0, 1, 2], vec![], TimeRange::new(0, ONE_HOUR));
            let result = family.filter(&ctx).unwrap();
            result
                .iter()
                .map(|rs| rs.load(&[0, 1, 2]).unwrap().len())
                .sum::<usize>()
        });
        thread::sleep(Duration::from_millis(20));
        f.family.flush().unwrap();
        assert!(!f.family.has_memory_data());

        // the rows are seen exactly once, from memory or from the table
        assert_eq!(reader.join().unwrap(), 3);
        let ctx = FilterContext::new(1, vec![0, 1, 2], vec![], TimeRange::new(0, ONE_HOUR));
        let after: usize = f
            .family
            .filter(&ctx)
            .unwrap()
            .iter()
            .map(|rs| rs.load(&[0, 1, 2]).unwrap().len())
            .sum();
        assert_eq!(after, 3);
    }

    #[test]
    fn flushes_compact_tables_past_threshold() {
        let config = EngineConfig::default().with_compact_threshold(3);
        let f = fixture_with(default_factory(), config, DatabaseOption::default());
        for _ in 0..10 {
            f.family.write_rows(&rows(2)).unwrap();
            f.family.flush().unwrap();
            assert!(f.kv.num_of_tables() < 3);
        }
        assert!(f.family.statistics().snapshot().compactions >= 4);

        // every flushed value survived the merges
        let ctx = FilterContext::new(1, vec![0, 1], vec![], TimeRange::new(0, ONE_HOUR));
        let result = f.family.filter(&ctx).unwrap();
        assert_eq!(result.len(), 1);
        let total: f64 = result[0]
            .load(&[0, 1])
            .unwrap()
            .iter()
            .map(|d| d.block.fields["f"].slots.values().sum::<f64>())
            .sum();
        assert_eq!(total, 20.0);
    }

    #[test]
    fn close_flushes_remaining_data() {
        let f = fixture(default_factory());
        f.family.write_rows(&rows(2)).unwrap();
        f.family.close().unwrap();
        assert_eq!(f.kv.num_of_tables(), 1);
        assert!(f.manager.get("db/1/10s/0").is_none());
        assert!(f.family.write_rows(&rows(1)).is_err());
    }

    #[test]
    fn evict_requires_idle_family() {
        let f = fixture(default_factory());
        f.family.retain();
        assert!(!f.family.evict());
        f.family.release();

        // Family time range is far in the past but it was just read.
        assert!(!f.family.evict());

        f.family.set_last_read_time(now_millis() - IDLE_READ_THRESHOLD - ONE_SECOND);
        f.family.write_rows(&rows(1)).unwrap();
        assert!(!f.family.evict());

        f.family.flush().unwrap();
        assert!(f.family.evict());
        assert!(f.family.is_closed());
        assert_eq!(f.family.statistics().snapshot().evictions, 1);
    }
}
