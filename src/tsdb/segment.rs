//! Segments group the families of one calendar bucket.
//!
//! On disk a shard interval looks like
//! `segment/<interval>/<segment name>/<family number>/`, where each segment
//! directory is one kv store and each family number one kv family.

use super::StorageContext;
use super::family::DataFamily;
use crate::interval::{Interval, IntervalType, TimeRange};
use crate::kv;
use crate::memdb::MetricBlockMerger;
use crate::{LinDbError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// All families of one day, month or year, sharing one kv store.
pub struct DataSegment {
    name: String,
    shard_indicator: String,
    interval: Interval,
    interval_type: IntervalType,
    segment_time: i64,
    time_range: TimeRange,
    store: kv::Store,
    families: RwLock<BTreeMap<i32, Arc<DataFamily>>>,
    ctx: StorageContext,
    me: Weak<DataSegment>,
}

impl DataSegment {
    pub fn open(
        ctx: StorageContext,
        shard_indicator: impl Into<String>,
        dir: impl AsRef<Path>,
        interval: Interval,
        segment_time: i64,
    ) -> Result<Arc<Self>> {
        let interval_type = interval.interval_type();
        let name = interval_type.segment_name(segment_time);
        let store = kv::Store::open(name.clone(), dir, Arc::new(MetricBlockMerger))?;
        Ok(Arc::new_cyclic(|me| Self {
            time_range: interval_type.segment_time_range(segment_time),
            name,
            shard_indicator: shard_indicator.into(),
            interval,
            interval_type,
            segment_time,
            store,
            families: RwLock::new(BTreeMap::new()),
            ctx,
            me: me.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn segment_time(&self) -> i64 {
        self.segment_time
    }

    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    /// Returns the family a timestamp belongs to, creating it when missing.
    pub fn get_or_create_data_family(&self, timestamp: i64) -> Result<Arc<DataFamily>> {
        if !self.time_range.contains(timestamp) {
            return Err(LinDbError::OutOfWritableWindow {
                timestamp,
                min: self.time_range.start,
                max: self.time_range.end,
            });
        }
        let family = self.interval_type.calc_family(timestamp, self.segment_time);
        self.get_or_load_family(family, false)
    }

    /// Like [`Self::get_or_create_data_family`], but retains the family before
    /// the segment lock is released so it cannot be evicted in between. The
    /// caller releases it.
    pub fn acquire_data_family(&self, timestamp: i64) -> Result<Arc<DataFamily>> {
        if !self.time_range.contains(timestamp) {
            return Err(LinDbError::OutOfWritableWindow {
                timestamp,
                min: self.time_range.start,
                max: self.time_range.end,
            });
        }
        let family = self.interval_type.calc_family(timestamp, self.segment_time);
        self.get_or_load_family(family, true)
    }

    fn get_or_load_family(&self, family: i32, retain: bool) -> Result<Arc<DataFamily>> {
        let found = |f: &Arc<DataFamily>| {
            if retain {
                f.retain();
            }
            Arc::clone(f)
        };
        if let Some(f) = self.families.read().get(&family) {
            return Ok(found(f));
        }

        let mut families = self.families.write();
        if let Some(f) = families.get(&family) {
            return Ok(found(f));
        }
        let kv_family = self.store.create_family(&family.to_string())?;
        let start = self.interval_type.calc_family_start_time(self.segment_time, family);
        let end = self.interval_type.calc_family_end_time(self.segment_time, family);
        let data_family = DataFamily::open(
            self.ctx.clone(),
            format!("{}/{}/{}", self.shard_indicator, self.interval, start),
            self.interval,
            TimeRange::new(start, end),
            kv_family,
            self.me.clone(),
        );
        families.insert(family, Arc::clone(&data_family));
        Ok(found(&data_family))
    }

    /// Families overlapping a time range, loading those only present on disk.
    pub fn get_data_families(&self, time_range: &TimeRange) -> Result<Vec<Arc<DataFamily>>> {
        if !self.time_range.overlaps(time_range) {
            return Ok(Vec::new());
        }
        let mut numbers: Vec<i32> = self
            .store
            .list_families()
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        numbers.extend(self.families.read().keys().copied());
        numbers.sort_unstable();
        numbers.dedup();

        let mut result = Vec::new();
        for family in numbers {
            let range = TimeRange::new(
                self.interval_type.calc_family_start_time(self.segment_time, family),
                self.interval_type.calc_family_end_time(self.segment_time, family),
            );
            if range.overlaps(time_range) {
                result.push(self.get_or_load_family(family, false)?);
            }
        }
        Ok(result)
    }

    /// Families currently loaded in memory.
    pub fn loaded_families(&self) -> Vec<Arc<DataFamily>> {
        self.families.read().values().cloned().collect()
    }

    /// Forgets `family` if it is still evictable once writers are locked
    /// out. It is reloaded from disk on next access.
    pub(crate) fn detach_family(&self, family: &DataFamily) -> bool {
        let number = self
            .interval_type
            .calc_family(family.family_time(), self.segment_time);
        let mut families = self.families.write();
        let loaded = families
            .get(&number)
            .is_some_and(|f| std::ptr::eq(Arc::as_ptr(f), family));
        if !loaded || !family.is_evictable() {
            return false;
        }
        families.remove(&number);
        debug!(segment = %self.name, family_time = family.family_time(), "Forgot evicted family");
        true
    }

    pub fn close(&self) -> Result<()> {
        let families: Vec<Arc<DataFamily>> =
            std::mem::take(&mut *self.families.write()).into_values().collect();
        let mut first_err = None;
        for family in families {
            if let Err(e) = family.close() {
                warn!(family = %family.indicator(), error = %e, "Failed to close family");
                first_err.get_or_insert(e);
            }
        }
        self.store.close()?;
        first_err.map_or(Ok(()), Err)
    }
}

/// Segments of one shard and interval.
pub struct IntervalSegment {
    dir: PathBuf,
    shard_indicator: String,
    interval: Interval,
    segments: RwLock<BTreeMap<i64, Arc<DataSegment>>>,
    ctx: StorageContext,
}

impl IntervalSegment {
    /// Opens the interval directory and every segment already on disk.
    pub fn open(
        ctx: StorageContext,
        shard_indicator: impl Into<String>,
        dir: impl AsRef<Path>,
        interval: Interval,
    ) -> Result<Self> {
        let shard_indicator = shard_indicator.into();
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| LinDbError::io_at(&dir, e))?;

        let interval_type = interval.interval_type();
        let mut segments = BTreeMap::new();
        for entry in fs::read_dir(&dir).map_err(|e| LinDbError::io_at(&dir, e))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let segment_time = match interval_type.parse_segment_time(&name) {
                Ok(t) => t,
                Err(e) => {
                    warn!(dir = %dir.display(), segment = %name, error = %e, "Skipping unknown segment directory");
                    continue;
                }
            };
            let segment = DataSegment::open(
                ctx.clone(),
                shard_indicator.clone(),
                entry.path(),
                interval,
                segment_time,
            )?;
            segments.insert(segment_time, segment);
        }

        if !segments.is_empty() {
            info!(shard = %shard_indicator, interval = %interval, segments = segments.len(), "Loaded segments");
        }

        Ok(Self {
            dir,
            shard_indicator,
            interval,
            segments: RwLock::new(segments),
            ctx,
        })
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Returns the segment a timestamp falls into, creating it when missing.
    pub fn get_or_create_segment(&self, timestamp: i64) -> Result<Arc<DataSegment>> {
        let interval_type = self.interval.interval_type();
        let segment_time = interval_type.calc_segment_time(timestamp);
        if let Some(s) = self.segments.read().get(&segment_time) {
            return Ok(Arc::clone(s));
        }

        let mut segments = self.segments.write();
        if let Some(s) = segments.get(&segment_time) {
            return Ok(Arc::clone(s));
        }
        let segment = DataSegment::open(
            self.ctx.clone(),
            self.shard_indicator.clone(),
            self.dir.join(interval_type.segment_name(segment_time)),
            self.interval,
            segment_time,
        )?;
        segments.insert(segment_time, Arc::clone(&segment));
        debug!(shard = %self.shard_indicator, segment = %segment.name(), "Created segment");
        Ok(segment)
    }

    pub fn get_or_create_data_family(&self, timestamp: i64) -> Result<Arc<DataFamily>> {
        self.get_or_create_segment(timestamp)?
            .get_or_create_data_family(timestamp)
    }

    /// Retained family for a write; see [`DataSegment::acquire_data_family`].
    pub fn acquire_data_family(&self, timestamp: i64) -> Result<Arc<DataFamily>> {
        self.get_or_create_segment(timestamp)?
            .acquire_data_family(timestamp)
    }

    /// Families of every segment overlapping a time range.
    pub fn get_data_families(&self, time_range: &TimeRange) -> Result<Vec<Arc<DataFamily>>> {
        let segments: Vec<Arc<DataSegment>> = self
            .segments
            .read()
            .values()
            .filter(|s| s.time_range().overlaps(time_range))
            .cloned()
            .collect();
        let mut result = Vec::new();
        for segment in segments {
            result.extend(segment.get_data_families(time_range)?);
        }
        Ok(result)
    }

    pub fn loaded_families(&self) -> Vec<Arc<DataFamily>> {
        self.segments
            .read()
            .values()
            .flat_map(|s| s.loaded_families())
            .collect()
    }

    pub fn num_of_segments(&self) -> usize {
        self.segments.read().len()
    }

    pub fn close(&self) -> Result<()> {
        let segments: Vec<Arc<DataSegment>> =
            std::mem::take(&mut *self.segments.write()).into_values().collect();
        let mut first_err = None;
        for segment in segments {
            if let Err(e) = segment.close() {
                warn!(segment = %segment.name(), error = %e, "Failed to close segment");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseOption, EngineConfig};
    use crate::interval::{ONE_DAY, ONE_HOUR};
    use crate::memdb::{MetricRow, default_factory};
    use crate::tsdb::FamilyManager;
    use crate::{Field, FieldType};
    use std::thread;
    use tempfile::TempDir;

    // 2024-03-05T00:00:00Z
    const DAY: i64 = 1_709_596_800_000;

    fn ctx(manager: &Arc<FamilyManager>) -> StorageContext {
        StorageContext {
            config: Arc::new(EngineConfig::default()),
            option: Arc::new(DatabaseOption::default()),
            memdb_factory: default_factory(),
            family_manager: Arc::clone(manager),
        }
    }

    fn row(timestamp: i64) -> MetricRow {
        MetricRow {
            metric_id: 1,
            series_id: 1,
            timestamp,
            fields: vec![Field::new("f", FieldType::Sum, 1.0)],
        }
    }

    #[test]
    fn families_map_to_hours_of_a_day() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(FamilyManager::new());
        let segments =
            IntervalSegment::open(ctx(&manager), "db/1", dir.path(), Interval::from_secs(10))
                .unwrap();

        let f1 = segments.get_or_create_data_family(DAY + 3 * ONE_HOUR + 5).unwrap();
        let f2 = segments.get_or_create_data_family(DAY + 3 * ONE_HOUR + 500).unwrap();
        assert!(Arc::ptr_eq(&f1, &f2));
        assert_eq!(f1.family_time(), DAY + 3 * ONE_HOUR);
        assert_eq!(f1.time_range().end, DAY + 4 * ONE_HOUR - 1);
        assert_eq!(f1.indicator(), format!("db/1/10s/{}", DAY + 3 * ONE_HOUR));

        segments.get_or_create_data_family(DAY + ONE_DAY).unwrap();
        assert_eq!(segments.num_of_segments(), 2);
        assert_eq!(manager.len(), 2);
        assert!(dir.path().join("20240305").join("3").is_dir());
    }

    #[test]
    fn families_reload_from_disk() {
        let dir = TempDir::new().unwrap();
        let ts = DAY + 7 * ONE_HOUR;
        {
            let manager = Arc::new(FamilyManager::new());
            let segments =
                IntervalSegment::open(ctx(&manager), "db/1", dir.path(), Interval::from_secs(10))
                    .unwrap();
            let family = segments.get_or_create_data_family(ts).unwrap();
            family.write_rows(&[row(ts)]).unwrap();
            segments.close().unwrap();
            assert_eq!(manager.len(), 0);
        }

        let manager = Arc::new(FamilyManager::new());
        let segments =
            IntervalSegment::open(ctx(&manager), "db/1", dir.path(), Interval::from_secs(10))
                .unwrap();
        assert_eq!(segments.num_of_segments(), 1);
        assert!(segments.loaded_families().is_empty());

        let found = segments
            .get_data_families(&TimeRange::new(DAY, DAY + ONE_DAY - 1))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].family_time(), ts);

        let none = segments
            .get_data_families(&TimeRange::new(DAY, DAY + ONE_HOUR))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn evicted_family_is_forgotten() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(FamilyManager::new());
        let segment =
            DataSegment::open(ctx(&manager), "db/1", dir.path(), Interval::from_secs(10), DAY)
                .unwrap();
        let family = segment.acquire_data_family(DAY + 5).unwrap();
        family.set_last_read_time(0);
        assert!(!family.evict());
        assert_eq!(segment.loaded_families().len(), 1);

        family.release();
        assert!(family.evict());
        assert!(family.is_closed());
        assert!(segment.loaded_families().is_empty());
        assert!(manager.is_empty());

        // the next access loads a fresh family that takes writes
        let reloaded = segment.acquire_data_family(DAY + 5).unwrap();
        assert!(!Arc::ptr_eq(&family, &reloaded));
        reloaded.write_rows(&[row(DAY + 5)]).unwrap();
        reloaded.release();
        assert_eq!(manager.len(), 1);
        // closing the evicted family again leaves the new one registered
        family.close().unwrap();
        assert!(manager.get(reloaded.indicator()).is_some());
        assert!(segment.get_or_create_data_family(DAY + 2 * ONE_DAY).is_err());
    }

    #[test]
    fn writes_never_reach_an_evicted_family() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(FamilyManager::new());
        let segment =
            DataSegment::open(ctx(&manager), "db/1", dir.path(), Interval::from_secs(10), DAY)
                .unwrap();

        let writer = {
            let segment = Arc::clone(&segment);
            thread::spawn(move || {
                for _ in 0..200 {
                    let family = segment.acquire_data_family(DAY + 5).unwrap();
                    family.write_rows(&[row(DAY + 5)]).unwrap();
                    family.release();
                    family.flush().unwrap();
                    family.set_last_read_time(0);
                }
            })
        };
        while !writer.is_finished() {
            for family in segment.loaded_families() {
                family.set_last_read_time(0);
                family.evict();
            }
        }
        // a failed write panics the writer
        writer.join().unwrap();
        assert!(manager.len() <= 1);
    }
}
