//! Storage engine root.
//!
//! The engine owns the registries of live families and shards, the flush
//! checker, the janitor evicting idle families, the query worker pools and
//! every database under `data_dir`. Databases found on disk are reopened
//! when the engine is built.

use super::StorageContext;
use super::database::Database;
use super::flush_checker::{DataFlushChecker, MemoryUsageSampler, system_memory_sampler};
use super::manager::{FamilyManager, FlushableShard, ShardManager};
use crate::config::{DatabaseOption, EngineConfig};
use crate::memdb::{MemoryDatabaseFactory, default_factory};
use crate::metrics::QueryStatistics;
use crate::query::QueryPools;
use crate::{LinDbError, Result};
use crossbeam_channel::{Sender, bounded, select, tick};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const DATABASE_DIR: &str = "db";

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    memdb_factory: MemoryDatabaseFactory,
    memory_sampler: MemoryUsageSampler,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            memdb_factory: default_factory(),
            memory_sampler: system_memory_sampler(),
        }
    }

    /// Replaces how data families create their memory databases.
    pub fn with_memdb_factory(mut self, factory: MemoryDatabaseFactory) -> Self {
        self.memdb_factory = factory;
        self
    }

    /// Replaces the memory usage source of the flush checker.
    pub fn with_memory_sampler(mut self, sampler: MemoryUsageSampler) -> Self {
        self.memory_sampler = sampler;
        self
    }

    /// Opens the engine, reloads existing databases and starts the flush
    /// checker and janitor.
    pub fn build(self) -> Result<Arc<Engine>> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let db_dir = config.data_dir.join(DATABASE_DIR);
        fs::create_dir_all(&db_dir).map_err(|e| LinDbError::io_at(&db_dir, e))?;

        let family_manager = Arc::new(FamilyManager::new());
        let shard_manager = Arc::new(ShardManager::new());
        let flush_checker =
            DataFlushChecker::new(&config, Arc::clone(&shard_manager), self.memory_sampler);
        let engine = Arc::new(Engine {
            query_pools: Arc::new(QueryPools::new(&config.query_pool)),
            query_stats: Arc::new(QueryStatistics::default()),
            db_dir,
            memdb_factory: self.memdb_factory,
            family_manager,
            shard_manager,
            databases: RwLock::new(HashMap::new()),
            flush_checker,
            janitor: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        });

        engine.load_databases()?;
        engine.flush_checker.start()?;
        engine.start_janitor()?;
        info!(data_dir = %engine.config.data_dir.display(), databases = engine.databases.read().len(), "Storage engine started");
        Ok(engine)
    }
}

struct Janitor {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Engine {
    config: Arc<EngineConfig>,
    db_dir: PathBuf,
    memdb_factory: MemoryDatabaseFactory,
    family_manager: Arc<FamilyManager>,
    shard_manager: Arc<ShardManager>,
    databases: RwLock<HashMap<String, Arc<Database>>>,
    flush_checker: DataFlushChecker,
    janitor: Mutex<Option<Janitor>>,
    query_pools: Arc<QueryPools>,
    query_stats: Arc<QueryStatistics>,
    closed: AtomicBool,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    fn context(&self, option: &DatabaseOption) -> StorageContext {
        StorageContext {
            config: Arc::clone(&self.config),
            option: Arc::new(option.clone()),
            memdb_factory: Arc::clone(&self.memdb_factory),
            family_manager: Arc::clone(&self.family_manager),
        }
    }

    fn load_databases(&self) -> Result<()> {
        let entries = fs::read_dir(&self.db_dir).map_err(|e| LinDbError::io_at(&self.db_dir, e))?;
        let mut databases = self.databases.write();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let option = match Database::load_option(entry.path()) {
                Ok(option) => option,
                Err(e) => {
                    warn!(database = %name, error = %e, "Skipping database without a readable option");
                    continue;
                }
            };
            let db = Database::open(
                &name,
                entry.path(),
                option.clone(),
                self.context(&option),
                Arc::clone(&self.shard_manager),
            )?;
            debug!(database = %name, shards = db.num_of_shards(), "Database loaded");
            databases.insert(name, db);
        }
        Ok(())
    }

    fn start_janitor(&self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let ticker = tick(self.config.ttl_check_interval);
        let family_manager = Arc::clone(&self.family_manager);
        let handle = thread::Builder::new()
            .name("family-janitor".to_string())
            .spawn(move || {
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let evicted = evict_idle_families(&family_manager);
                            if evicted > 0 {
                                info!(evicted, "Evicted idle data families");
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                debug!("Family janitor stopped");
            })?;
        *self.janitor.lock() = Some(Janitor {
            shutdown: shutdown_tx,
            handle,
        });
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn family_manager(&self) -> &Arc<FamilyManager> {
        &self.family_manager
    }

    pub fn shard_manager(&self) -> &Arc<ShardManager> {
        &self.shard_manager
    }

    pub fn flush_checker(&self) -> &DataFlushChecker {
        &self.flush_checker
    }

    pub fn query_pools(&self) -> &Arc<QueryPools> {
        &self.query_pools
    }

    pub fn query_statistics(&self) -> &Arc<QueryStatistics> {
        &self.query_stats
    }

    /// Creates a database, or returns it when it already exists.
    pub fn create_database(&self, name: &str, option: DatabaseOption) -> Result<Arc<Database>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinDbError::EngineClosed);
        }
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(LinDbError::InvalidConfiguration(format!(
                "invalid database name '{name}'"
            )));
        }
        let mut databases = self.databases.write();
        if let Some(db) = databases.get(name) {
            if db.option() != &option {
                warn!(database = %name, "Database exists with another option, keeping it");
            }
            return Ok(Arc::clone(db));
        }
        let db = Database::open(
            name,
            self.db_dir.join(name),
            option.clone(),
            self.context(&option),
            Arc::clone(&self.shard_manager),
        )?;
        databases.insert(name.to_string(), Arc::clone(&db));
        info!(database = %name, "Database created");
        Ok(db)
    }

    pub fn get_database(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.read().get(name).cloned()
    }

    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Flushes every shard of a database through the flush checker.
    pub fn flush_database(&self, name: &str) -> Result<()> {
        let db = self
            .get_database(name)
            .ok_or_else(|| LinDbError::DatabaseNotFound(name.to_string()))?;
        for shard in db.shards() {
            let shard: Arc<dyn FlushableShard> = shard;
            self.flush_checker.flush_shard(shard, false);
        }
        Ok(())
    }

    /// Runs one eviction pass over all loaded families.
    pub fn evict_families(&self) -> usize {
        evict_idle_families(&self.family_manager)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops background work, then flushes and closes every database.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(janitor) = self.janitor.lock().take() {
            drop(janitor.shutdown);
            if janitor.handle.join().is_err() {
                error!("Family janitor panicked");
            }
        }
        self.flush_checker.stop();

        let databases: Vec<Arc<Database>> =
            std::mem::take(&mut *self.databases.write()).into_values().collect();
        let mut result = Ok(());
        for db in databases {
            if let Err(e) = db.close() {
                error!(database = %db.name(), error = %e, "Failed to close database");
                result = result.and(Err(e));
            }
        }
        result = result.and(self.query_pools.shutdown());
        info!("Storage engine closed");
        result
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Failed to close storage engine on drop");
        }
    }
}

fn evict_idle_families(family_manager: &FamilyManager) -> usize {
    let mut evicted = 0;
    family_manager.walk(|family| {
        if family.evict() {
            evicted += 1;
        }
    });
    evicted
}
