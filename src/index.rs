//! Metadata index of a database: metric names and tag sets mapped to ids.

use crate::tag::{self, Tag};
use crate::{LinDbError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

const INDEX_FILE_NAME: &str = "index.json";
const INDEX_TMP_FILE_NAME: &str = "index.json.tmp";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct MetricSeries {
    ids: HashMap<String, u32>,
    tags: HashMap<u32, Vec<Tag>>,
    next_series_id: u32,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct IndexState {
    metrics: HashMap<String, u32>,
    series: HashMap<u32, MetricSeries>,
    next_metric_id: u32,
}

/// Resolves metric names and tag sets to the ids stored in data families.
pub struct MetadataIndex {
    dir: PathBuf,
    state: RwLock<IndexState>,
    dirty: AtomicBool,
}

impl MetadataIndex {
    /// Opens the index stored in `dir`, starting empty when none exists.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| LinDbError::io_at(&dir, e))?;

        let path = dir.join(INDEX_FILE_NAME);
        let state = if path.exists() {
            let data = fs::read(&path).map_err(|e| LinDbError::io_at(&path, e))?;
            serde_json::from_slice(&data)?
        } else {
            IndexState::default()
        };

        Ok(Self {
            dir,
            state: RwLock::new(state),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn get_metric_id(&self, metric: &str) -> Result<u32> {
        self.state
            .read()
            .metrics
            .get(metric)
            .copied()
            .ok_or_else(|| LinDbError::MetricNotFound(metric.to_string()))
    }

    pub fn get_or_create_metric_id(&self, metric: &str) -> Result<u32> {
        tag::validate_metric_name(metric)?;
        if let Ok(id) = self.get_metric_id(metric) {
            return Ok(id);
        }

        let mut state = self.state.write();
        if let Some(id) = state.metrics.get(metric) {
            return Ok(*id);
        }
        state.next_metric_id += 1;
        let id = state.next_metric_id;
        state.metrics.insert(metric.to_string(), id);
        self.dirty.store(true, Ordering::Release);
        Ok(id)
    }

    /// Returns the series id of a tag set, assigning one on first sight.
    pub fn get_or_create_series_id(&self, metric_id: u32, tags: &[Tag]) -> Result<u32> {
        let key = tag::series_key(tags);
        if let Some(id) = self
            .state
            .read()
            .series
            .get(&metric_id)
            .and_then(|s| s.ids.get(&key))
        {
            return Ok(*id);
        }

        let mut state = self.state.write();
        let series = state.series.entry(metric_id).or_default();
        if let Some(id) = series.ids.get(&key) {
            return Ok(*id);
        }
        let id = series.next_series_id;
        series.next_series_id += 1;
        series.ids.insert(key.clone(), id);
        series.tags.insert(id, tag::parse_series_key(&key)?);
        self.dirty.store(true, Ordering::Release);
        Ok(id)
    }

    /// Series ids of a metric whose tags satisfy `matcher`, sorted.
    pub fn find_series_ids(&self, metric_id: u32, matcher: impl Fn(&[Tag]) -> bool) -> Vec<u32> {
        let state = self.state.read();
        let mut ids: Vec<u32> = state
            .series
            .get(&metric_id)
            .map(|s| {
                s.tags
                    .iter()
                    .filter(|(_, tags)| matcher(tags))
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn series_tags(&self, metric_id: u32, series_id: u32) -> Option<Vec<Tag>> {
        self.state
            .read()
            .series
            .get(&metric_id)
            .and_then(|s| s.tags.get(&series_id).cloned())
    }

    pub fn num_of_metrics(&self) -> usize {
        self.state.read().metrics.len()
    }

    /// Persists the index when it changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let data = serde_json::to_vec(&*self.state.read())?;
        let tmp = self.dir.join(INDEX_TMP_FILE_NAME);
        let path = self.dir.join(INDEX_FILE_NAME);
        let written = fs::write(&tmp, &data)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| LinDbError::io_at(&path, e));
        if written.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        written?;
        debug!(path = %path.display(), bytes = data.len(), "Flushed metadata index");
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ids_are_stable() {
        let dir = TempDir::new().unwrap();
        let index = MetadataIndex::open(dir.path()).unwrap();
        let cpu = index.get_or_create_metric_id("cpu").unwrap();
        assert_eq!(index.get_or_create_metric_id("cpu").unwrap(), cpu);
        assert_ne!(index.get_or_create_metric_id("mem").unwrap(), cpu);

        let a = index
            .get_or_create_series_id(cpu, &[Tag::new("host", "a"), Tag::new("dc", "x")])
            .unwrap();
        let b = index
            .get_or_create_series_id(cpu, &[Tag::new("dc", "x"), Tag::new("host", "a")])
            .unwrap();
        assert_eq!(a, b);
        assert!(matches!(
            index.get_metric_id("disk"),
            Err(LinDbError::MetricNotFound(_))
        ));
    }

    #[test]
    fn find_by_tags() {
        let dir = TempDir::new().unwrap();
        let index = MetadataIndex::open(dir.path()).unwrap();
        let m = index.get_or_create_metric_id("cpu").unwrap();
        for host in ["a", "b", "c"] {
            index
                .get_or_create_series_id(m, &[Tag::new("host", host)])
                .unwrap();
        }
        let ids = index.find_series_ids(m, |tags| tags.iter().any(|t| t.value != "b"));
        assert_eq!(ids.len(), 2);
        let tags = index.series_tags(m, ids[0]).unwrap();
        assert_eq!(tags[0].key, "host");
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let (m, s) = {
            let index = MetadataIndex::open(dir.path()).unwrap();
            let m = index.get_or_create_metric_id("cpu").unwrap();
            let s = index
                .get_or_create_series_id(m, &[Tag::new("host", "a")])
                .unwrap();
            index.close().unwrap();
            (m, s)
        };
        let index = MetadataIndex::open(dir.path()).unwrap();
        assert_eq!(index.get_metric_id("cpu").unwrap(), m);
        assert_eq!(
            index
                .get_or_create_series_id(m, &[Tag::new("host", "a")])
                .unwrap(),
            s
        );
    }
}
