//! File store on top of `std::fs`, rooted at a mount point. On the device the
//! root is the VFS mount of the storage partition.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{DirEntry, EntryKind, FileSink, FileStore, UsageStats};
use crate::error::StoreError;
use crate::path;

type UsageQuery = Box<dyn Fn() -> anyhow::Result<UsageStats> + Send + Sync>;

enum Capacity {
    /// Fixed size; usage is computed by walking the tree.
    Fixed(u64),
    /// Usage reported by the filesystem driver.
    Reported(UsageQuery),
}

pub struct DirStore {
    root: PathBuf,
    capacity: Capacity,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            root: root.into(),
            capacity: Capacity::Fixed(capacity),
        }
    }

    pub fn with_usage<F>(root: impl Into<PathBuf>, query: F) -> Self
    where
        F: Fn() -> anyhow::Result<UsageStats> + Send + Sync + 'static,
    {
        Self {
            root: root.into(),
            capacity: Capacity::Reported(Box::new(query)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, store_path: &str) -> Result<PathBuf, StoreError> {
        let normalized = path::normalize(store_path)?;
        Ok(self.root.join(normalized.trim_start_matches('/')))
    }

    fn used_bytes(&self) -> u64 {
        let mut used = 0;
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                match entry.metadata() {
                    Ok(meta) if meta.is_dir() => pending.push(entry.path()),
                    Ok(meta) => used += meta.len(),
                    Err(_) => {}
                }
            }
        }
        used
    }
}

impl FileStore for DirStore {
    type Writer = DirWriter;
    type Reader = fs::File;

    fn create(&mut self, store_path: &str) -> Result<DirWriter, StoreError> {
        let full = self.resolve(store_path)?;
        if full == self.root {
            return Err(StoreError::InvalidPath(store_path.to_string()));
        }
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(&full)?;
        Ok(DirWriter { file, written: 0 })
    }

    fn open(&self, store_path: &str) -> Result<(fs::File, u64), StoreError> {
        let full = self.resolve(store_path)?;
        match fs::metadata(&full) {
            Ok(meta) if meta.is_file() => Ok((fs::File::open(&full)?, meta.len())),
            Ok(_) => Err(StoreError::AlreadyExists(store_path.to_string())),
            Err(_) => Err(StoreError::NotFound(store_path.to_string())),
        }
    }

    fn remove(&mut self, store_path: &str) -> bool {
        let Ok(full) = self.resolve(store_path) else {
            return false;
        };
        if full == self.root {
            return false;
        }
        match fs::metadata(&full) {
            Ok(meta) if meta.is_dir() => fs::remove_dir(&full).is_ok(),
            Ok(_) => fs::remove_file(&full).is_ok(),
            Err(_) => false,
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> bool {
        let (Ok(from), Ok(to)) = (self.resolve(from), self.resolve(to)) else {
            return false;
        };
        if !from.is_file() || to.is_dir() {
            return false;
        }
        if fs::rename(&from, &to).is_ok() {
            return true;
        }
        // FAT will not rename over an existing file.
        to.is_file() && fs::remove_file(&to).is_ok() && fs::rename(&from, &to).is_ok()
    }

    fn mkdir(&mut self, store_path: &str) -> bool {
        self.resolve(store_path)
            .is_ok_and(|full| fs::create_dir(full).is_ok())
    }

    fn exists(&self, store_path: &str) -> bool {
        self.resolve(store_path).is_ok_and(|full| full.exists())
    }

    fn is_dir(&self, store_path: &str) -> bool {
        self.resolve(store_path).is_ok_and(|full| full.is_dir())
    }

    fn read_dir(&self, store_path: &str) -> Result<Vec<DirEntry>, StoreError> {
        let full = self.resolve(store_path)?;
        if !full.exists() {
            return Err(StoreError::NotFound(store_path.to_string()));
        }
        if !full.is_dir() {
            return Err(StoreError::NotADirectory(store_path.to_string()));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&full)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            let name = entry.file_name().to_string_lossy().to_string();
            entries.push(if meta.is_dir() {
                DirEntry {
                    name,
                    kind: EntryKind::Directory,
                    size: 0,
                }
            } else {
                DirEntry {
                    name,
                    kind: EntryKind::File,
                    size: meta.len(),
                }
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn stat(&self) -> UsageStats {
        match &self.capacity {
            Capacity::Fixed(total) => UsageStats::from_total_used(*total, self.used_bytes()),
            Capacity::Reported(query) => query().unwrap_or_else(|e| {
                log::warn!("Storage usage query failed: {e:#}");
                UsageStats::default()
            }),
        }
    }
}

pub struct DirWriter {
    file: fs::File,
    written: u64,
}

impl FileSink for DirWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, StoreError> {
        let n = self.file.write(bytes)?;
        self.written += n as u64;
        Ok(n)
    }

    fn close(mut self) -> Result<u64, StoreError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(self.written)
    }
}
