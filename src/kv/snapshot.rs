//! Point-in-time view over the tables of a family.

use super::table::TableReader;
use std::sync::Arc;

/// A table reader shared with snapshots.
pub type Reader = Arc<TableReader>;

/// Holds the tables of a family alive while a query reads them.
pub struct Snapshot {
    family: String,
    tables: Vec<Reader>,
}

impl Snapshot {
    pub(crate) fn new(family: String, tables: Vec<Reader>) -> Self {
        Self { family, tables }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    /// Returns the readers holding a value for `key`, oldest first.
    pub fn find_readers(&self, key: u32) -> Vec<Reader> {
        self.tables
            .iter()
            .filter(|t| {
                matches!((t.min_key(), t.max_key()), (Some(min), Some(max)) if key >= min && key <= max)
                    && t.contains(key)
            })
            .cloned()
            .collect()
    }

    pub fn num_of_tables(&self) -> usize {
        self.tables.len()
    }

    /// Releases the tables.
    pub fn close(self) {}
}
