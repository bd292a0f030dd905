//! kv store: a directory of named families.

use super::Merger;
use super::family::Family;
use crate::{LinDbError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Append-only key/value store made of independent families.
pub struct Store {
    name: String,
    dir: PathBuf,
    merger: Arc<dyn Merger>,
    families: RwLock<HashMap<String, Arc<Family>>>,
}

impl Store {
    /// Opens a store directory and every family found in it.
    pub fn open(name: impl Into<String>, dir: impl AsRef<Path>, merger: Arc<dyn Merger>) -> Result<Self> {
        let name = name.into();
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| LinDbError::io_at(&dir, e))?;

        let mut families = HashMap::new();
        for entry in fs::read_dir(&dir).map_err(|e| LinDbError::io_at(&dir, e))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let family_name = entry.file_name().to_string_lossy().into_owned();
            let family = Family::open(family_name.clone(), entry.path(), Arc::clone(&merger))?;
            families.insert(family_name, family);
        }

        debug!(store = %name, families = families.len(), "Opened kv store");

        Ok(Self {
            name,
            dir,
            merger,
            families: RwLock::new(families),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the family with the given name, creating it when missing.
    pub fn create_family(&self, name: &str) -> Result<Arc<Family>> {
        if let Some(family) = self.families.read().get(name) {
            return Ok(Arc::clone(family));
        }

        let mut families = self.families.write();
        if let Some(family) = families.get(name) {
            return Ok(Arc::clone(family));
        }
        let family = Family::open(name, self.dir.join(name), Arc::clone(&self.merger))?;
        families.insert(name.to_string(), Arc::clone(&family));
        info!(store = %self.name, family = name, "Created kv family");
        Ok(family)
    }

    pub fn get_family(&self, name: &str) -> Option<Arc<Family>> {
        self.families.read().get(name).cloned()
    }

    /// Names of all families currently in the store.
    pub fn list_families(&self) -> Vec<String> {
        let mut names: Vec<String> = self.families.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn close(&self) -> Result<()> {
        self.families.write().clear();
        debug!(store = %self.name, "Closed kv store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct LastWins;

    impl Merger for LastWins {
        fn merge(&self, _key: u32, values: &[&[u8]]) -> Result<Vec<u8>> {
            Ok(values.last().map(|v| v.to_vec()).unwrap_or_default())
        }
    }

    #[test]
    fn families_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open("s", dir.path(), Arc::new(LastWins)).unwrap();
            let family = store.create_family("13").unwrap();
            let mut flusher = family.new_flusher();
            flusher.add(1, b"v".to_vec());
            flusher.commit().unwrap();
            assert!(Arc::ptr_eq(&family, &store.create_family("13").unwrap()));
        }

        let store = Store::open("s", dir.path(), Arc::new(LastWins)).unwrap();
        assert_eq!(store.list_families(), vec!["13".to_string()]);
        let family = store.get_family("13").unwrap();
        assert_eq!(family.num_of_tables(), 1);
        assert!(store.get_family("14").is_none());
    }
}
