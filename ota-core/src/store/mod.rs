//! Persistent file store abstraction.

pub mod dir;
pub mod memory;

use serde::Serialize;

use crate::error::StoreError;

pub use dir::{DirStore, DirWriter};
pub use memory::{MemoryStore, MemoryWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// A direct child of a directory, as returned by [`FileStore::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UsageStats {
    #[serde(rename = "total")]
    pub total_bytes: u64,
    #[serde(rename = "used")]
    pub used_bytes: u64,
    #[serde(rename = "free")]
    pub free_bytes: u64,
}

impl UsageStats {
    /// Build stats from total and used bytes; used is clamped to total so that
    /// `used + free == total` always holds.
    pub fn from_total_used(total: u64, used: u64) -> Self {
        let used = used.min(total);
        Self {
            total_bytes: total,
            used_bytes: used,
            free_bytes: total - used,
        }
    }
}

/// Write handle on a file. Dropping it without [`FileSink::close`] still
/// releases the handle, but only `close` reports flush errors.
pub trait FileSink {
    /// Append `bytes`; returns how many were stored.
    fn write(&mut self, bytes: &[u8]) -> Result<usize, StoreError>;

    /// Flush and release the handle; returns the final file size.
    fn close(self) -> Result<u64, StoreError>
    where
        Self: Sized;
}

pub trait FileStore {
    type Writer: FileSink;
    type Reader: std::io::Read;

    /// Create or truncate `path` for writing.
    fn create(&mut self, path: &str) -> Result<Self::Writer, StoreError>;

    /// Open `path` for reading; returns the reader and the file size.
    fn open(&self, path: &str) -> Result<(Self::Reader, u64), StoreError>;

    /// Remove a file or an empty directory. Nothing changes on failure.
    fn remove(&mut self, path: &str) -> bool;

    /// Move the file at `from` to `to`, replacing a file already at `to`.
    /// Nothing changes on failure.
    fn rename(&mut self, from: &str, to: &str) -> bool;

    /// Create a single directory; its parent must exist.
    fn mkdir(&mut self, path: &str) -> bool;

    fn exists(&self, path: &str) -> bool;

    fn is_dir(&self, path: &str) -> bool;

    /// Direct children of `path`, ordered by name.
    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, StoreError>;

    fn stat(&self) -> UsageStats;
}
