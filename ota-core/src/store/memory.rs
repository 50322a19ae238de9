//! RAM-backed file store with a fixed capacity. Used by the host tests and as
//! a stand-in for the flash filesystem when simulating the device.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{DirEntry, EntryKind, FileSink, FileStore, UsageStats};
use crate::error::StoreError;
use crate::path;

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    capacity: u64,
    read_only: bool,
}

impl Inner {
    fn used(&self) -> u64 {
        self.nodes
            .values()
            .map(|node| match node {
                Node::File(data) => data.len() as u64,
                Node::Dir => 0,
            })
            .sum()
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(path), Some(Node::Dir))
    }

    fn children<'a>(&'a self, dir: &str) -> impl Iterator<Item = (&'a String, &'a Node)> + 'a {
        let prefix = if dir == path::ROOT {
            path::ROOT.to_string()
        } else {
            format!("{dir}/")
        };
        let skip = prefix.len();
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(key, _)| key.starts_with(&prefix))
            .filter(move |(key, _)| {
                let rest = &key[skip..];
                !rest.is_empty() && !rest.contains('/')
            })
    }
}

/// Cloning yields another handle on the same store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new(capacity: u64) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(path::ROOT.to_string(), Node::Dir);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                nodes,
                capacity,
                read_only: false,
            })),
        }
    }

    /// Refuse every mutation, the way a filesystem mounted read-only would.
    pub fn set_read_only(&self, read_only: bool) {
        self.lock().read_only = read_only;
    }

    /// Whole contents of a file, for assertions.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let path = path::normalize(path).ok()?;
        match self.lock().nodes.get(&path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FileStore for MemoryStore {
    type Writer = MemoryWriter;
    type Reader = Cursor<Vec<u8>>;

    fn create(&mut self, path: &str) -> Result<MemoryWriter, StoreError> {
        let path = path::normalize(path)?;
        if path == path::ROOT {
            return Err(StoreError::InvalidPath(path));
        }

        let mut inner = self.lock();
        if inner.read_only {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "store is read-only",
            )));
        }
        if inner.is_dir(&path) {
            return Err(StoreError::AlreadyExists(path));
        }

        // Parent directories are created on demand, as LittleFS does.
        let mut ancestor = String::new();
        let components: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        for component in &components[..components.len() - 1] {
            ancestor.push('/');
            ancestor.push_str(component);
            match inner.nodes.get(&ancestor) {
                Some(Node::Dir) => {}
                Some(Node::File(_)) => return Err(StoreError::NotADirectory(ancestor)),
                None => {
                    inner.nodes.insert(ancestor.clone(), Node::Dir);
                }
            }
        }

        inner.nodes.insert(path.clone(), Node::File(Vec::new()));
        Ok(MemoryWriter {
            inner: self.inner.clone(),
            path,
        })
    }

    fn open(&self, path: &str) -> Result<(Cursor<Vec<u8>>, u64), StoreError> {
        let path = path::normalize(path)?;
        match self.lock().nodes.get(&path) {
            Some(Node::File(data)) => Ok((Cursor::new(data.clone()), data.len() as u64)),
            Some(Node::Dir) => Err(StoreError::AlreadyExists(path)),
            None => Err(StoreError::NotFound(path)),
        }
    }

    fn remove(&mut self, path: &str) -> bool {
        let Ok(path) = path::normalize(path) else {
            return false;
        };
        let mut inner = self.lock();
        if inner.read_only || path == path::ROOT {
            return false;
        }
        match inner.nodes.get(&path) {
            Some(Node::File(_)) => inner.nodes.remove(&path).is_some(),
            Some(Node::Dir) => {
                if inner.children(&path).next().is_some() {
                    return false;
                }
                inner.nodes.remove(&path).is_some()
            }
            None => false,
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> bool {
        let (Ok(from), Ok(to)) = (path::normalize(from), path::normalize(to)) else {
            return false;
        };
        let mut inner = self.lock();
        if inner.read_only || inner.is_dir(&to) || !inner.is_dir(path::parent(&to)) {
            return false;
        }
        if from == to {
            return matches!(inner.nodes.get(&from), Some(Node::File(_)));
        }
        match inner.nodes.remove(&from) {
            Some(Node::File(data)) => {
                inner.nodes.insert(to, Node::File(data));
                true
            }
            Some(Node::Dir) => {
                inner.nodes.insert(from, Node::Dir);
                false
            }
            None => false,
        }
    }

    fn mkdir(&mut self, path: &str) -> bool {
        let Ok(path) = path::normalize(path) else {
            return false;
        };
        let mut inner = self.lock();
        if inner.read_only || inner.nodes.contains_key(&path) || !inner.is_dir(path::parent(&path)) {
            return false;
        }
        inner.nodes.insert(path, Node::Dir);
        true
    }

    fn exists(&self, path: &str) -> bool {
        path::normalize(path).is_ok_and(|path| self.lock().nodes.contains_key(&path))
    }

    fn is_dir(&self, path: &str) -> bool {
        path::normalize(path).is_ok_and(|path| self.lock().is_dir(&path))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, StoreError> {
        let path = path::normalize(path)?;
        let inner = self.lock();
        match inner.nodes.get(&path) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => return Err(StoreError::NotADirectory(path)),
            None => return Err(StoreError::NotFound(path)),
        }

        Ok(inner
            .children(&path)
            .map(|(key, node)| {
                let name = path::file_name(key).to_string();
                match node {
                    Node::File(data) => DirEntry {
                        name,
                        kind: EntryKind::File,
                        size: data.len() as u64,
                    },
                    Node::Dir => DirEntry {
                        name,
                        kind: EntryKind::Directory,
                        size: 0,
                    },
                }
            })
            .collect())
    }

    fn stat(&self) -> UsageStats {
        let inner = self.lock();
        UsageStats::from_total_used(inner.capacity, inner.used())
    }
}

pub struct MemoryWriter {
    inner: Arc<Mutex<Inner>>,
    path: String,
}

impl MemoryWriter {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FileSink for MemoryWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let free = inner.capacity.saturating_sub(inner.used());
        let take = bytes.len().min(usize::try_from(free).unwrap_or(usize::MAX));
        if take == 0 && !bytes.is_empty() {
            return Err(StoreError::NoSpace);
        }

        match inner.nodes.get_mut(&self.path) {
            Some(Node::File(data)) => {
                data.extend_from_slice(&bytes[..take]);
                Ok(take)
            }
            _ => Err(StoreError::NotFound(self.path.clone())),
        }
    }

    fn close(self) -> Result<u64, StoreError> {
        match self.lock().nodes.get(&self.path) {
            Some(Node::File(data)) => Ok(data.len() as u64),
            _ => Err(StoreError::NotFound(self.path.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Read;

    fn write_file(store: &mut MemoryStore, path: &str, data: &[u8]) {
        let mut writer = store.create(path).unwrap();
        assert_eq!(writer.write(data).unwrap(), data.len());
        writer.close().unwrap();
    }

    #[test]
    fn test_create_write_read() {
        let mut store = MemoryStore::new(1024);
        write_file(&mut store, "/a/b.txt", b"0123456789");

        assert!(store.is_dir("/a"));
        let (mut reader, size) = store.open("/a/b.txt").unwrap();
        assert_eq!(size, 10);
        let mut buf = String::new();
        reader.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "0123456789");
    }

    #[test]
    fn test_rename_replaces_destination() {
        let mut store = MemoryStore::new(64);
        write_file(&mut store, "/cfg.json", b"old");
        write_file(&mut store, "/cfg.json.tmp", b"newer");

        assert!(store.rename("/cfg.json.tmp", "/cfg.json"));
        assert!(!store.exists("/cfg.json.tmp"));
        assert_eq!(store.contents("/cfg.json").unwrap(), b"newer");
        assert_eq!(store.stat().used_bytes, 5);
    }

    #[test]
    fn test_rename_refuses_directories_and_missing_parents() {
        let mut store = MemoryStore::new(64);
        write_file(&mut store, "/a/b.txt", b"x");

        assert!(!store.rename("/a", "/c"));
        assert!(!store.rename("/a/b.txt", "/a"));
        assert!(!store.rename("/a/b.txt", "/missing/b.txt"));
        assert!(!store.rename("/nothing", "/a/c.txt"));
        assert!(store.is_dir("/a"));
        assert_eq!(store.contents("/a/b.txt").unwrap(), b"x");
    }

    #[test]
    fn test_read_dir_lists_direct_children_only() {
        let mut store = MemoryStore::new(1024);
        write_file(&mut store, "/a/b.txt", b"x");
        write_file(&mut store, "/a/c/d.txt", b"y");
        write_file(&mut store, "/ab.txt", b"z");

        let names: Vec<String> = store.read_dir("/a").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["b.txt", "c"]);

        let root = store.read_dir("/").unwrap();
        assert_eq!(root.len(), 2);
        assert!(root[0].is_dir());
        assert_eq!(root[1].size, 1);
        assert!(matches!(store.read_dir("/ab.txt"), Err(StoreError::NotADirectory(_))));
    }

    #[test]
    fn test_mkdir_requires_parent() {
        let mut store = MemoryStore::new(1024);
        assert!(!store.mkdir("/x/y"));
        assert!(store.mkdir("/x"));
        assert!(!store.mkdir("/x"));
        assert!(store.mkdir("/x/y"));
    }

    #[test]
    fn test_remove_refuses_non_empty_dir() {
        let mut store = MemoryStore::new(1024);
        write_file(&mut store, "/d/f", b"1");
        assert!(!store.remove("/d"));
        assert!(store.remove("/d/f"));
        assert!(store.remove("/d"));
        assert!(!store.remove("/d"));
        assert!(!store.remove("/"));
    }

    #[test]
    fn test_short_write_when_full() {
        let mut store = MemoryStore::new(8);
        let mut writer = store.create("/big.bin").unwrap();
        assert_eq!(writer.write(&[0u8; 12]).unwrap(), 8);
        assert!(matches!(writer.write(&[0u8; 1]), Err(StoreError::NoSpace)));
        assert_eq!(writer.close().unwrap(), 8);
    }

    #[test]
    fn test_read_only_store() {
        let mut store = MemoryStore::new(64);
        store.set_read_only(true);
        assert!(store.create("/f").is_err());
        assert!(!store.mkdir("/d"));
    }

    proptest! {
        #[test]
        fn prop_usage_adds_up(sizes in proptest::collection::vec(0usize..64, 0..12), capacity in 0u64..512) {
            let mut store = MemoryStore::new(capacity);
            for (i, size) in sizes.iter().enumerate() {
                if let Ok(mut writer) = store.create(&format!("/f{i}")) {
                    let _ = writer.write(&vec![7u8; *size]);
                }
            }
            let stats = store.stat();
            prop_assert_eq!(stats.used_bytes + stats.free_bytes, stats.total_bytes);
            prop_assert!(stats.used_bytes <= capacity);
        }
    }
}
