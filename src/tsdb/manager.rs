//! Registries of live families and shards.
//!
//! Background janitors walk these instead of the database/shard object
//! graph. Both are owned by the engine and handed to whoever needs them.

use super::family::DataFamily;
use crate::Result;
use dashmap::DashMap;
use std::sync::Arc;

/// What the flush checker needs from a shard.
pub trait FlushableShard: Send + Sync {
    /// Stable key: `database/shard`.
    fn indicator(&self) -> &str;

    /// Whether any family of the shard should be flushed now.
    fn need_flush(&self) -> bool;

    fn is_flushing(&self) -> bool;

    /// Heap size of all memory databases of the shard.
    fn mem_size(&self) -> usize;

    fn flush(&self) -> Result<()>;
}

/// Every open data family, keyed by indicator.
#[derive(Default)]
pub struct FamilyManager {
    families: DashMap<String, Arc<DataFamily>>,
}

impl FamilyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, family: Arc<DataFamily>) {
        self.families.insert(family.indicator().to_string(), family);
    }

    /// Removes `family`, leaving alone a newer family registered under the
    /// same indicator after `family` was evicted.
    pub fn remove(&self, family: &DataFamily) {
        self.families
            .remove_if(family.indicator(), |_, f| std::ptr::eq(Arc::as_ptr(f), family));
    }

    pub fn get(&self, indicator: &str) -> Option<Arc<DataFamily>> {
        self.families.get(indicator).map(|f| Arc::clone(f.value()))
    }

    /// Calls `f` for every family. The registry is not locked while `f`
    /// runs, so `f` may add or remove families.
    pub fn walk(&self, mut f: impl FnMut(&Arc<DataFamily>)) {
        let families: Vec<Arc<DataFamily>> =
            self.families.iter().map(|e| Arc::clone(e.value())).collect();
        for family in &families {
            f(family);
        }
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}

/// Every open shard, keyed by indicator.
#[derive(Default)]
pub struct ShardManager {
    shards: DashMap<String, Arc<dyn FlushableShard>>,
}

impl ShardManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, shard: Arc<dyn FlushableShard>) {
        self.shards.insert(shard.indicator().to_string(), shard);
    }

    pub fn remove(&self, indicator: &str) {
        self.shards.remove(indicator);
    }

    pub fn get(&self, indicator: &str) -> Option<Arc<dyn FlushableShard>> {
        self.shards.get(indicator).map(|s| Arc::clone(s.value()))
    }

    /// Calls `f` for every shard without holding the registry locked.
    pub fn walk(&self, mut f: impl FnMut(&Arc<dyn FlushableShard>)) {
        let shards: Vec<Arc<dyn FlushableShard>> =
            self.shards.iter().map(|e| Arc::clone(e.value())).collect();
        for shard in &shards {
            f(shard);
        }
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}
