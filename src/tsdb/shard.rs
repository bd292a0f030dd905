//! Shard: routes rows of one database partition to their data families.

use super::StorageContext;
use super::family::DataFamily;
use super::manager::FlushableShard;
use super::segment::IntervalSegment;
use crate::index::MetadataIndex;
use crate::interval::{TimeRange, now_millis};
use crate::memdb::MetricRow;
use crate::metrics::ShardStatistics;
use crate::{Result, Row};
use std::collections::HashMap;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, instrument};

/// A family retained for the duration of a write; released on drop.
struct RetainedFamily(Arc<DataFamily>);

impl Deref for RetainedFamily {
    type Target = DataFamily;

    fn deref(&self) -> &DataFamily {
        &self.0
    }
}

impl Drop for RetainedFamily {
    fn drop(&mut self) {
        self.0.release();
    }
}

pub struct Shard {
    database: String,
    id: u32,
    indicator: String,
    index: Arc<MetadataIndex>,
    segment: IntervalSegment,
    ctx: StorageContext,
    is_flushing: AtomicBool,
    stats: ShardStatistics,
}

impl Shard {
    /// Opens the shard stored under `dir`, writing with the database's
    /// storage interval.
    pub fn open(
        ctx: StorageContext,
        database: impl Into<String>,
        id: u32,
        dir: impl AsRef<Path>,
        index: Arc<MetadataIndex>,
    ) -> Result<Self> {
        let database = database.into();
        let indicator = format!("{database}/{id}");
        let interval = ctx.option.write_interval();
        let segment = IntervalSegment::open(
            ctx.clone(),
            indicator.clone(),
            dir.as_ref().join("segment").join(interval.to_string()),
            interval,
        )?;
        info!(shard = %indicator, interval = %interval, "Opened shard");
        Ok(Self {
            database,
            id,
            indicator,
            index,
            segment,
            ctx,
            is_flushing: AtomicBool::new(false),
            stats: ShardStatistics::default(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn statistics(&self) -> &ShardStatistics {
        &self.stats
    }

    pub fn index(&self) -> &Arc<MetadataIndex> {
        &self.index
    }

    /// Writable window `[now - behind, now + ahead]`.
    pub fn writable_window(&self) -> TimeRange {
        let now = now_millis();
        TimeRange::new(now - self.ctx.option.behind, now + self.ctx.option.ahead)
    }

    /// Resolves rows to families. Rows outside the writable window or with an
    /// invalid metric are counted and dropped.
    fn group_rows(&self, rows: &[Row]) -> Result<Vec<(RetainedFamily, Vec<MetricRow>)>> {
        let window = self.writable_window();
        let mut groups: HashMap<String, (RetainedFamily, Vec<MetricRow>)> = HashMap::new();

        for row in rows {
            if !window.contains(row.timestamp()) {
                self.stats.out_of_window_rows.fetch_add(1, Ordering::Relaxed);
                debug!(shard = %self.indicator, timestamp = row.timestamp(), "Row outside writable window");
                continue;
            }
            let metric_id = match self.index.get_or_create_metric_id(row.metric()) {
                Ok(id) => id,
                Err(e) => {
                    self.stats.invalid_rows.fetch_add(1, Ordering::Relaxed);
                    debug!(shard = %self.indicator, error = %e, "Dropped invalid row");
                    continue;
                }
            };
            let series_id = self.index.get_or_create_series_id(metric_id, row.tags())?;
            let family = RetainedFamily(self.segment.acquire_data_family(row.timestamp())?);

            let metric_row = MetricRow {
                metric_id,
                series_id,
                timestamp: row.timestamp(),
                fields: row.fields().to_vec(),
            };
            groups
                .entry(family.indicator().to_string())
                .or_insert_with(|| (family, Vec::new()))
                .1
                .push(metric_row);
        }
        Ok(groups.into_values().collect())
    }

    /// Writes rows without replica sequence tracking.
    pub fn write_rows(&self, rows: &[Row]) -> Result<()> {
        for (family, metric_rows) in self.group_rows(rows)? {
            family.write_rows(&metric_rows)?;
            self.stats
                .write_rows
                .fetch_add(metric_rows.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Writes a replicated batch. Families that already committed `seq` for
    /// `leader` skip the batch.
    pub fn write_rows_with_sequence(&self, leader: i32, seq: i64, rows: &[Row]) -> Result<()> {
        for (family, metric_rows) in self.group_rows(rows)? {
            if !family.validate_sequence(leader, seq) {
                self.stats.duplicate_sequences.fetch_add(1, Ordering::Relaxed);
                debug!(family = %family.indicator(), leader, seq, "Skipped replayed sequence");
                continue;
            }
            family.write_rows(&metric_rows)?;
            family.commit_sequence(leader, seq);
            self.stats
                .write_rows
                .fetch_add(metric_rows.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Families of the storage interval overlapping a time range.
    pub fn get_data_families(&self, time_range: &TimeRange) -> Result<Vec<Arc<DataFamily>>> {
        self.segment.get_data_families(time_range)
    }

    pub fn loaded_families(&self) -> Vec<Arc<DataFamily>> {
        self.segment.loaded_families()
    }

    pub fn close(&self) -> Result<()> {
        let result = self.segment.close();
        self.index.flush()?;
        info!(shard = %self.indicator, "Closed shard");
        result
    }
}

impl FlushableShard for Shard {
    fn indicator(&self) -> &str {
        &self.indicator
    }

    fn need_flush(&self) -> bool {
        self.segment
            .loaded_families()
            .iter()
            .any(|f| f.need_flush() || f.has_pending_immutable())
    }

    fn is_flushing(&self) -> bool {
        self.is_flushing.load(Ordering::Acquire)
    }

    fn mem_size(&self) -> usize {
        self.segment.loaded_families().iter().map(|f| f.mem_size()).sum()
    }

    /// Flushes the metadata index and every family holding memory data.
    #[instrument(skip(self), fields(shard = %self.indicator))]
    fn flush(&self) -> Result<()> {
        if self
            .is_flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let start = Instant::now();

        let mut result = self.index.flush();
        for family in self.segment.loaded_families() {
            if !family.has_memory_data() {
                continue;
            }
            if let Err(e) = family.flush() {
                result = result.and(Err(e));
            }
        }

        match &result {
            Ok(()) => {
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                debug!(
                    shard = %self.indicator,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Flushed shard"
                );
            }
            Err(e) => {
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                error!(shard = %self.indicator, error = %e, "Failed to flush shard");
            }
        }
        self.is_flushing.store(false, Ordering::Release);
        result
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("indicator", &self.indicator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseOption, EngineConfig};
    use crate::filter::FilterContext;
    use crate::interval::ONE_HOUR;
    use crate::memdb::default_factory;
    use crate::tsdb::FamilyManager;
    use crate::{Field, FieldType, Tag};
    use tempfile::TempDir;

    fn open_shard(dir: &TempDir) -> (Shard, Arc<FamilyManager>) {
        let manager = Arc::new(FamilyManager::new());
        let ctx = StorageContext {
            config: Arc::new(EngineConfig::default()),
            option: Arc::new(DatabaseOption::default()),
            memdb_factory: default_factory(),
            family_manager: Arc::clone(&manager),
        };
        let index = Arc::new(MetadataIndex::open(dir.path().join("index")).unwrap());
        let shard = Shard::open(ctx, "db", 1, dir.path().join("shard/1"), index).unwrap();
        (shard, manager)
    }

    fn row(host: &str, timestamp: i64) -> Row {
        Row::with_tags(
            "cpu",
            vec![Tag::new("host", host)],
            timestamp,
            vec![Field::new("usage", FieldType::Sum, 1.0)],
        )
    }

    #[test]
    fn rows_outside_window_are_counted() {
        let dir = TempDir::new().unwrap();
        let (shard, _) = open_shard(&dir);
        let now = now_millis();
        shard
            .write_rows(&[row("a", now), row("b", now - 3 * ONE_HOUR), row("c", now + 3 * ONE_HOUR)])
            .unwrap();
        let s = shard.statistics().snapshot();
        assert_eq!(s.write_rows, 1);
        assert_eq!(s.out_of_window_rows, 2);
        assert!(shard.mem_size() > 0);
        assert!(shard.loaded_families().iter().all(|f| f.ref_count() == 0));
    }

    #[test]
    fn replayed_sequence_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (shard, _) = open_shard(&dir);
        let now = now_millis();
        shard.write_rows_with_sequence(1, 10, &[row("a", now)]).unwrap();
        shard.write_rows_with_sequence(1, 10, &[row("a", now)]).unwrap();
        shard.write_rows_with_sequence(1, 11, &[row("a", now)]).unwrap();
        let s = shard.statistics().snapshot();
        assert_eq!(s.write_rows, 2);
        assert_eq!(s.duplicate_sequences, 1);

        let family = &shard.loaded_families()[0];
        assert_eq!(family.committed_sequence(1), Some(11));
    }

    #[test]
    fn flush_persists_families() {
        let dir = TempDir::new().unwrap();
        let (shard, manager) = open_shard(&dir);
        let now = now_millis();
        shard.write_rows(&[row("a", now), row("b", now)]).unwrap();
        assert!(!shard.need_flush());

        shard.flush().unwrap();
        assert_eq!(shard.mem_size(), 0);
        assert!(!shard.is_flushing());

        let metric_id = shard.index().get_metric_id("cpu").unwrap();
        let families = shard
            .get_data_families(&TimeRange::new(now - ONE_HOUR, now + ONE_HOUR))
            .unwrap();
        assert_eq!(families.len(), 1);
        let ctx = FilterContext::new(metric_id, vec![0, 1], vec![], TimeRange::new(now - 1, now + 1));
        let result = families[0].filter(&ctx).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].series_ids(), &[0, 1]);

        shard.close().unwrap();
        assert!(manager.is_empty());
    }
}
