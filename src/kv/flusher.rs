//! Flusher: collects the values of one flush and publishes them atomically.

use super::family::Family;
use super::table::TableBuilder;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Collects values for a new table of a [`Family`].
pub struct Flusher {
    family: Arc<Family>,
    builder: TableBuilder,
    sequences: HashMap<i32, i64>,
}

impl Flusher {
    pub(crate) fn new(family: Arc<Family>) -> Self {
        Self {
            family,
            builder: TableBuilder::new(),
            sequences: HashMap::new(),
        }
    }

    /// Adds a value under a key.
    pub fn add(&mut self, key: u32, value: Vec<u8>) {
        self.builder.add(key, value);
    }

    /// Records the replica sequence of a leader covered by this flush.
    pub fn sequence(&mut self, leader: i32, seq: i64) {
        let entry = self.sequences.entry(leader).or_insert(seq);
        *entry = (*entry).max(seq);
    }

    pub fn num_of_entries(&self) -> usize {
        self.builder.len()
    }

    /// Writes the table and publishes it with the recorded sequences.
    pub fn commit(self) -> Result<()> {
        if self.builder.is_empty() && self.sequences.is_empty() {
            return Ok(());
        }
        self.family.commit(self.builder, self.sequences)
    }

    /// Drops everything collected so far.
    pub fn release(self) {}
}
