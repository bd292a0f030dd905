//! Immutable key/value table files.
//!
//! Layout: `[values...][index][index_offset: u64 LE][magic: u64 LE]`, where the
//! index is a bincode-encoded sorted list of `(key, offset, len)`.

use crate::{LinDbError, Result};
use bytes::{BufMut, BytesMut};
use memmap2::{Mmap, MmapOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const TABLE_EXTENSION: &str = "sst";
const TABLE_MAGIC: u64 = 0x4c69_6e44_4254_0001;
const FOOTER_SIZE: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    key: u32,
    offset: u64,
    len: u32,
}

/// Builds a table from key/value pairs.
#[derive(Default)]
pub struct TableBuilder {
    entries: BTreeMap<u32, Vec<u8>>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value; a later add for the same key replaces the earlier one.
    pub fn add(&mut self, key: u32, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Writes the table to `path`, syncing it before returning.
    pub fn finish(self, path: &Path) -> Result<u64> {
        let value_bytes: usize = self.entries.values().map(Vec::len).sum();
        let mut buf = BytesMut::with_capacity(value_bytes + self.entries.len() * 16 + FOOTER_SIZE);
        let mut index = Vec::with_capacity(self.entries.len());

        for (key, value) in &self.entries {
            index.push(IndexEntry {
                key: *key,
                offset: buf.len() as u64,
                len: value.len() as u32,
            });
            buf.put_slice(value);
        }

        let index_offset = buf.len() as u64;
        buf.put_slice(&bincode::serialize(&index)?);
        buf.put_u64_le(index_offset);
        buf.put_u64_le(TABLE_MAGIC);

        let mut file = File::create(path).map_err(|e| LinDbError::io_at(path, e))?;
        file.write_all(&buf)
            .map_err(|e| LinDbError::io_at(path, e))?;
        file.sync_all().map_err(|e| LinDbError::io_at(path, e))?;
        Ok(buf.len() as u64)
    }
}

/// Reads a memory-mapped table.
pub struct TableReader {
    file_id: u64,
    path: PathBuf,
    mmap: Mmap,
    index: Vec<IndexEntry>,
}

impl TableReader {
    pub fn open(file_id: u64, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| LinDbError::io_at(&path, e))?;
        // SAFETY: table files are never modified after being written.
        let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(|e| LinDbError::MemoryMap {
            path: path.clone(),
            details: e.to_string(),
        })?;

        if mmap.len() < FOOTER_SIZE {
            return Err(LinDbError::DataCorruption(format!(
                "table {:?} is too short ({} bytes)",
                path,
                mmap.len()
            )));
        }

        let footer = &mmap[mmap.len() - FOOTER_SIZE..];
        let index_offset = u64::from_le_bytes(footer[..8].try_into().map_err(|_| {
            LinDbError::DataCorruption(format!("table {:?} footer unreadable", path))
        })?) as usize;
        let magic = u64::from_le_bytes(footer[8..].try_into().map_err(|_| {
            LinDbError::DataCorruption(format!("table {:?} footer unreadable", path))
        })?);
        if magic != TABLE_MAGIC {
            return Err(LinDbError::DataCorruption(format!(
                "table {:?} has bad magic {:#x}",
                path, magic
            )));
        }
        if index_offset > mmap.len() - FOOTER_SIZE {
            return Err(LinDbError::DataCorruption(format!(
                "table {:?} index offset {} out of bounds",
                path, index_offset
            )));
        }

        let index: Vec<IndexEntry> =
            bincode::deserialize(&mmap[index_offset..mmap.len() - FOOTER_SIZE])?;
        for entry in &index {
            if entry.offset as usize + entry.len as usize > index_offset {
                return Err(LinDbError::DataCorruption(format!(
                    "table {:?} value of key {} out of bounds",
                    path, entry.key
                )));
            }
        }

        Ok(Self {
            file_id,
            path,
            mmap,
            index,
        })
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn min_key(&self) -> Option<u32> {
        self.index.first().map(|e| e.key)
    }

    pub fn max_key(&self) -> Option<u32> {
        self.index.last().map(|e| e.key)
    }

    pub fn contains(&self, key: u32) -> bool {
        self.index.binary_search_by_key(&key, |e| e.key).is_ok()
    }

    /// Returns the value stored for a key.
    pub fn get(&self, key: u32) -> Option<&[u8]> {
        let idx = self.index.binary_search_by_key(&key, |e| e.key).ok()?;
        let entry = &self.index[idx];
        let start = entry.offset as usize;
        Some(&self.mmap[start..start + entry.len as usize])
    }

    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.index.iter().map(|e| e.key)
    }

    pub fn size(&self) -> usize {
        self.mmap.len()
    }
}

/// File name of a table.
pub fn table_file_name(file_id: u64) -> String {
    format!("{:06}.{}", file_id, TABLE_EXTENSION)
}

/// Parses a table file name back into its id.
pub fn parse_table_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(&format!(".{}", TABLE_EXTENSION))?;
    stem.parse().ok()
}

/// Removes a table file, ignoring a missing file.
pub fn remove_table(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LinDbError::io_at(path, e)),
    }
}
