//! Database: option, metadata index and shards of one named database.

use super::StorageContext;
use super::manager::{FlushableShard, ShardManager};
use super::shard::Shard;
use crate::config::DatabaseOption;
use crate::index::MetadataIndex;
use crate::{LinDbError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const OPTION_FILE_NAME: &str = "OPTION.json";

pub struct Database {
    name: String,
    dir: PathBuf,
    option: Arc<DatabaseOption>,
    index: Arc<MetadataIndex>,
    shards: RwLock<BTreeMap<u32, Arc<Shard>>>,
    ctx: StorageContext,
    shard_manager: Arc<ShardManager>,
}

impl Database {
    /// Reads the option persisted in a database directory.
    pub fn load_option(dir: impl AsRef<Path>) -> Result<DatabaseOption> {
        let path = dir.as_ref().join(OPTION_FILE_NAME);
        let data = fs::read(&path).map_err(|e| LinDbError::io_at(&path, e))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Opens a database directory, persisting its option and loading every
    /// shard found on disk.
    pub fn open(
        name: impl Into<String>,
        dir: impl AsRef<Path>,
        option: DatabaseOption,
        ctx: StorageContext,
        shard_manager: Arc<ShardManager>,
    ) -> Result<Arc<Self>> {
        option.validate()?;
        let name = name.into();
        let dir = dir.as_ref().to_path_buf();
        let shard_dir = dir.join("shard");
        fs::create_dir_all(&shard_dir).map_err(|e| LinDbError::io_at(&shard_dir, e))?;

        let option_path = dir.join(OPTION_FILE_NAME);
        fs::write(&option_path, serde_json::to_vec_pretty(&option)?)
            .map_err(|e| LinDbError::io_at(&option_path, e))?;

        let option = Arc::new(option);
        let ctx = StorageContext {
            option: Arc::clone(&option),
            ..ctx
        };
        let index = Arc::new(MetadataIndex::open(dir.join("index"))?);
        let db = Arc::new(Self {
            name,
            dir,
            option,
            index,
            shards: RwLock::new(BTreeMap::new()),
            ctx,
            shard_manager,
        });

        let mut ids = Vec::new();
        for entry in fs::read_dir(&shard_dir).map_err(|e| LinDbError::io_at(&shard_dir, e))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().to_string_lossy().parse::<u32>() {
                Ok(id) => ids.push(id),
                Err(_) => warn!(database = %db.name, path = %entry.path().display(), "Skipping unknown shard directory"),
            }
        }
        db.create_shards(&ids)?;
        info!(database = %db.name, shards = ids.len(), "Opened database");
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn option(&self) -> &DatabaseOption {
        &self.option
    }

    pub fn index(&self) -> &Arc<MetadataIndex> {
        &self.index
    }

    /// Opens the given shards, skipping those already open.
    pub fn create_shards(&self, ids: &[u32]) -> Result<()> {
        let mut shards = self.shards.write();
        for id in ids {
            if shards.contains_key(id) {
                continue;
            }
            let shard = Arc::new(Shard::open(
                self.ctx.clone(),
                self.name.clone(),
                *id,
                self.dir.join("shard").join(id.to_string()),
                Arc::clone(&self.index),
            )?);
            self.shard_manager.add(Arc::clone(&shard) as Arc<dyn FlushableShard>);
            shards.insert(*id, shard);
        }
        Ok(())
    }

    pub fn get_shard(&self, id: u32) -> Result<Arc<Shard>> {
        self.shards
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| LinDbError::ShardNotFound {
                database: self.name.clone(),
                shard_id: id,
            })
    }

    pub fn shards(&self) -> Vec<Arc<Shard>> {
        self.shards.read().values().cloned().collect()
    }

    pub fn num_of_shards(&self) -> usize {
        self.shards.read().len()
    }

    /// Flushes every shard, returning the first error.
    pub fn flush(&self) -> Result<()> {
        let mut result = Ok(());
        for shard in self.shards() {
            result = result.and(shard.flush());
        }
        result
    }

    pub fn close(&self) -> Result<()> {
        let shards: Vec<Arc<Shard>> =
            std::mem::take(&mut *self.shards.write()).into_values().collect();
        let mut result = Ok(());
        for shard in shards {
            self.shard_manager.remove(shard.indicator());
            if let Err(e) = shard.close() {
                warn!(shard = %shard.indicator(), error = %e, "Failed to close shard");
                result = result.and(Err(e));
            }
        }
        result.and(self.index.close())
    }
}
