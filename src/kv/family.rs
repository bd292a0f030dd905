//! A kv family: an append-only set of immutable tables plus the replica
//! sequences that were durably flushed with them.

use super::flusher::Flusher;
use super::snapshot::Snapshot;
use super::table::{
    TableBuilder, TableReader, parse_table_file_name, remove_table, table_file_name,
};
use super::Merger;
use crate::{LinDbError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const MANIFEST_FILE_NAME: &str = "MANIFEST.json";
const MANIFEST_TMP_FILE_NAME: &str = "MANIFEST.json.tmp";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    next_file_id: u64,
    files: Vec<u64>,
    sequences: BTreeMap<i32, i64>,
}

#[derive(Clone, Default)]
struct Version {
    tables: Vec<Arc<TableReader>>,
    sequences: HashMap<i32, i64>,
}

/// One kv family stored in its own directory.
pub struct Family {
    name: String,
    dir: PathBuf,
    merger: Arc<dyn Merger>,
    version: RwLock<Version>,
    next_file_id: AtomicU64,
    commit_lock: Mutex<()>,
}

impl Family {
    /// Opens (or creates) a family directory, loading its manifest.
    pub fn open(name: impl Into<String>, dir: impl AsRef<Path>, merger: Arc<dyn Merger>) -> Result<Arc<Self>> {
        let name = name.into();
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| LinDbError::io_at(&dir, e))?;

        let manifest_path = dir.join(MANIFEST_FILE_NAME);
        let manifest: Manifest = if manifest_path.exists() {
            let data = fs::read(&manifest_path).map_err(|e| LinDbError::io_at(&manifest_path, e))?;
            serde_json::from_slice(&data)?
        } else {
            Manifest::default()
        };

        let mut tables = Vec::with_capacity(manifest.files.len());
        for file_id in &manifest.files {
            let path = dir.join(table_file_name(*file_id));
            tables.push(Arc::new(TableReader::open(*file_id, path)?));
        }

        // Tables written by a flush that never reached the manifest.
        let live: BTreeSet<u64> = manifest.files.iter().copied().collect();
        let mut max_seen = manifest.next_file_id;
        for entry in fs::read_dir(&dir).map_err(|e| LinDbError::io_at(&dir, e))? {
            let entry = entry?;
            let file_name = entry.file_name();
            if let Some(file_id) = parse_table_file_name(&file_name.to_string_lossy()) {
                max_seen = max_seen.max(file_id + 1);
                if !live.contains(&file_id) {
                    warn!(family = %name, file_id, "Removing orphan table file");
                    remove_table(&entry.path())?;
                }
            }
        }

        debug!(family = %name, tables = tables.len(), "Opened kv family");

        Ok(Arc::new(Self {
            name,
            dir,
            merger,
            version: RwLock::new(Version {
                tables,
                sequences: manifest.sequences.into_iter().collect(),
            }),
            next_file_id: AtomicU64::new(max_seen),
            commit_lock: Mutex::new(()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates a flusher that publishes a new table on commit.
    pub fn new_flusher(self: &Arc<Self>) -> Flusher {
        Flusher::new(Arc::clone(self))
    }

    /// Captures the current set of tables for reading.
    pub fn get_snapshot(&self) -> Snapshot {
        Snapshot::new(self.name.clone(), self.version.read().tables.clone())
    }

    /// Replica sequences persisted by previous flushes.
    pub fn sequences(&self) -> HashMap<i32, i64> {
        self.version.read().sequences.clone()
    }

    pub fn num_of_tables(&self) -> usize {
        self.version.read().tables.len()
    }

    /// Writes a table (when there are entries) and publishes it together with
    /// the flushed sequences.
    pub(crate) fn commit(&self, builder: TableBuilder, sequences: HashMap<i32, i64>) -> Result<()> {
        let _guard = self.commit_lock.lock();

        let mut next = self.version.read().clone();
        let mut written = None;
        if !builder.is_empty() {
            let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
            let path = self.dir.join(table_file_name(file_id));
            builder.finish(&path)?;
            match TableReader::open(file_id, &path) {
                Ok(reader) => next.tables.push(Arc::new(reader)),
                Err(e) => {
                    remove_table(&path)?;
                    return Err(e);
                }
            }
            written = Some(path);
        }

        for (leader, seq) in sequences {
            let entry = next.sequences.entry(leader).or_insert(seq);
            *entry = (*entry).max(seq);
        }

        if let Err(e) = self.write_manifest(&next) {
            if let Some(path) = written {
                remove_table(&path)?;
            }
            return Err(e);
        }

        *self.version.write() = next;
        Ok(())
    }

    /// Merges all tables into one. Returns false when there was nothing to do.
    pub fn compact(&self) -> Result<bool> {
        let _guard = self.commit_lock.lock();

        let current = self.version.read().clone();
        if current.tables.len() < 2 {
            return Ok(false);
        }

        let keys: BTreeSet<u32> = current.tables.iter().flat_map(|t| t.keys()).collect();
        let mut builder = TableBuilder::new();
        for key in keys {
            let values: Vec<&[u8]> = current.tables.iter().filter_map(|t| t.get(key)).collect();
            let merged = if values.len() == 1 {
                values[0].to_vec()
            } else {
                self.merger.merge(key, &values)?
            };
            builder.add(key, merged);
        }

        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(table_file_name(file_id));
        builder.finish(&path)?;
        let reader = TableReader::open(file_id, &path)?;

        let next = Version {
            tables: vec![Arc::new(reader)],
            sequences: current.sequences.clone(),
        };
        if let Err(e) = self.write_manifest(&next) {
            remove_table(&path)?;
            return Err(e);
        }
        *self.version.write() = next;

        // Open snapshots keep their mappings alive after the unlink.
        for table in &current.tables {
            remove_table(table.path())?;
        }

        info!(
            family = %self.name,
            merged_tables = current.tables.len(),
            file_id,
            "Compacted kv family"
        );
        Ok(true)
    }

    fn write_manifest(&self, version: &Version) -> Result<()> {
        let manifest = Manifest {
            next_file_id: self.next_file_id.load(Ordering::SeqCst),
            files: version.tables.iter().map(|t| t.file_id()).collect(),
            sequences: version
                .sequences
                .iter()
                .map(|(k, v)| (*k, *v))
                .collect(),
        };
        let tmp = self.dir.join(MANIFEST_TMP_FILE_NAME);
        let data = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&tmp, data).map_err(|e| LinDbError::io_at(&tmp, e))?;
        let target = self.dir.join(MANIFEST_FILE_NAME);
        fs::rename(&tmp, &target).map_err(|e| LinDbError::io_at(&target, e))?;
        Ok(())
    }
}
