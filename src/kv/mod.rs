//! Append-only key/value storage used by data segments.
//!
//! A [`Store`] owns named [`Family`] directories; each family is a list of
//! immutable memory-mapped tables. Writes go through a [`Flusher`], reads
//! through a [`Snapshot`].

mod family;
mod flusher;
mod snapshot;
mod store;
pub mod table;

pub use family::Family;
pub use flusher::Flusher;
pub use snapshot::{Reader, Snapshot};
pub use store::Store;

use crate::Result;

/// Merges the values stored for one key in several tables, oldest first.
pub trait Merger: Send + Sync {
    fn merge(&self, key: u32, values: &[&[u8]]) -> Result<Vec<u8>>;
}
