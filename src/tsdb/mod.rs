//! Storage engine: databases, shards, segments and data families.

pub mod database;
pub mod engine;
pub mod family;
pub mod flush_checker;
pub mod manager;
pub mod segment;
pub mod shard;

use crate::config::{DatabaseOption, EngineConfig};
use crate::memdb::MemoryDatabaseFactory;
use std::sync::Arc;

pub use database::Database;
pub use engine::{Engine, EngineBuilder};
pub use family::DataFamily;
pub use flush_checker::{DataFlushChecker, MemoryUsageSampler, system_memory_sampler};
pub use manager::{FamilyManager, FlushableShard, ShardManager};
pub use segment::{DataSegment, IntervalSegment};
pub use shard::Shard;

/// What every storage object below the engine needs from it.
#[derive(Clone)]
pub struct StorageContext {
    pub config: Arc<EngineConfig>,
    pub option: Arc<DatabaseOption>,
    pub memdb_factory: MemoryDatabaseFactory,
    pub family_manager: Arc<FamilyManager>,
}
