//! Recursive listing of the file store.
//!
//! Traversal uses an explicit, fixed-capacity stack instead of recursion: the
//! HTTP task on the device runs with a few kilobytes of stack.

use heapless::Vec as StackVec;
use serde::Serialize;

use crate::error::StoreError;
use crate::path;
use crate::store::{DirEntry, EntryKind, FileStore, UsageStats};

/// Hard upper bound on how many directory levels are descended.
pub const MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
}

/// Listing response body: usage plus the flattened tree.
#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    #[serde(flatten)]
    pub usage: UsageStats,
    pub files: Vec<FileEntry>,
}

struct Frame {
    prefix: String,
    entries: std::vec::IntoIter<DirEntry>,
}

pub struct DirectoryCatalog<'a, S> {
    store: &'a S,
    max_depth: usize,
}

impl<'a, S: FileStore> DirectoryCatalog<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self::with_max_depth(store, MAX_DEPTH)
    }

    /// `max_depth` is clamped to [`MAX_DEPTH`].
    pub fn with_max_depth(store: &'a S, max_depth: usize) -> Self {
        Self {
            store,
            max_depth: max_depth.clamp(1, MAX_DEPTH),
        }
    }

    /// Depth-first, pre-order listing below `root`. Each directory is emitted
    /// before its contents. Directories deeper than the depth limit are listed
    /// but not descended.
    pub fn list(&self, root: &str) -> Result<Vec<FileEntry>, StoreError> {
        let root = path::normalize(root)?;
        let root_prefix = if root == path::ROOT {
            root.clone()
        } else {
            format!("{root}/")
        };

        let mut out = Vec::new();
        let mut stack: StackVec<Frame, MAX_DEPTH> = StackVec::new();
        let first = Frame {
            prefix: root_prefix,
            entries: self.store.read_dir(&root)?.into_iter(),
        };
        if stack.push(first).is_err() {
            return Ok(out);
        }

        while let Some(frame) = stack.last_mut() {
            let Some(entry) = frame.entries.next() else {
                stack.pop();
                continue;
            };

            let name = format!("{}{}", frame.prefix, entry.name);
            if !entry.is_dir() {
                out.push(FileEntry {
                    name,
                    kind: EntryKind::File,
                    size: entry.size,
                });
                continue;
            }

            out.push(FileEntry {
                name: name.clone(),
                kind: EntryKind::Directory,
                size: 0,
            });

            if stack.len() >= self.max_depth {
                log::warn!("Listing depth limit {} reached at {}", self.max_depth, name);
                continue;
            }

            let entries = match self.store.read_dir(&name) {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!("Skipping unreadable directory {}: {}", name, e);
                    continue;
                }
            };
            let child = Frame {
                prefix: format!("{name}/"),
                entries: entries.into_iter(),
            };
            if stack.push(child).is_err() {
                log::warn!("Listing stack full at {}", name);
            }
        }

        Ok(out)
    }

    /// Every directory below `root`, depth-first.
    pub fn directories(&self, root: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .list(root)?
            .into_iter()
            .filter(|entry| entry.kind == EntryKind::Directory)
            .map(|entry| entry.name)
            .collect())
    }

    pub fn usage(&self) -> UsageStats {
        self.store.stat()
    }

    pub fn listing(&self, root: &str) -> Result<Listing, StoreError> {
        Ok(Listing {
            usage: self.usage(),
            files: self.list(root)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileSink, MemoryStore};

    fn store_with(files: &[(&str, usize)], dirs: &[&str]) -> MemoryStore {
        let mut store = MemoryStore::new(1 << 16);
        for dir in dirs {
            assert!(store.mkdir(dir));
        }
        for (path, size) in files {
            let mut writer = store.create(path).unwrap();
            writer.write(&vec![b'x'; *size]).unwrap();
            writer.close().unwrap();
        }
        store
    }

    fn entry(name: &str, kind: EntryKind, size: u64) -> FileEntry {
        FileEntry {
            name: name.to_string(),
            kind,
            size,
        }
    }

    #[test]
    fn test_depth_first_order() {
        let store = store_with(&[("/a/b.txt", 10)], &["/a", "/a/c"]);
        let entries = DirectoryCatalog::new(&store).list("/").unwrap();
        assert_eq!(
            entries,
            vec![
                entry("/a", EntryKind::Directory, 0),
                entry("/a/b.txt", EntryKind::File, 10),
                entry("/a/c", EntryKind::Directory, 0),
            ]
        );
    }

    #[test]
    fn test_siblings_after_subtree() {
        let store = store_with(&[("/a/x/deep.bin", 3), ("/z.txt", 1)], &[]);
        let names: Vec<String> = DirectoryCatalog::new(&store)
            .list("/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["/a", "/a/x", "/a/x/deep.bin", "/z.txt"]);
    }

    #[test]
    fn test_list_subdirectory() {
        let store = store_with(&[("/www/css/site.css", 4), ("/www/index.html", 5)], &[]);
        let names: Vec<String> = DirectoryCatalog::new(&store)
            .list("/www")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["/www/css", "/www/css/site.css", "/www/index.html"]);
    }

    #[test]
    fn test_depth_limit_stops_descent() {
        let store = store_with(&[("/l1/l2/l3/file.txt", 1)], &[]);
        let catalog = DirectoryCatalog::with_max_depth(&store, 2);
        let names: Vec<String> = catalog.list("/").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["/l1", "/l1/l2"]);
    }

    #[test]
    fn test_deep_tree_is_bounded() {
        let path: String = (0..40).map(|i| format!("/d{i}")).collect::<String>() + "/leaf";
        let store = store_with(&[(&path, 1)], &[]);
        let entries = DirectoryCatalog::new(&store).list("/").unwrap();
        assert_eq!(entries.len(), MAX_DEPTH);
        assert!(entries.iter().all(|e| e.kind == EntryKind::Directory));
    }

    #[test]
    fn test_every_child_prefixed_by_parent() {
        let store = store_with(&[("/a/b/c.txt", 1), ("/a/d.txt", 2), ("/e/f.txt", 3)], &[]);
        let entries = DirectoryCatalog::new(&store).list("/").unwrap();
        for entry in &entries {
            let parent = path::parent(&entry.name);
            if parent != path::ROOT {
                assert!(entries
                    .iter()
                    .any(|e| e.name == parent && e.kind == EntryKind::Directory));
            }
        }
        let mut names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        names.dedup();
        assert_eq!(names.len(), entries.len());
    }

    #[test]
    fn test_directories_and_listing() {
        let store = store_with(&[("/a/b.txt", 10)], &["/a", "/a/c"]);
        let catalog = DirectoryCatalog::new(&store);
        assert_eq!(catalog.directories("/").unwrap(), vec!["/a", "/a/c"]);

        let json = serde_json::to_value(catalog.listing("/").unwrap()).unwrap();
        assert_eq!(json["total"], 1 << 16);
        assert_eq!(json["used"], 10);
        assert_eq!(json["free"], (1 << 16) - 10);
        assert_eq!(json["files"][1]["type"], "file");
        assert_eq!(json["files"][0]["type"], "directory");
    }

    #[test]
    fn test_missing_root() {
        let store = MemoryStore::new(16);
        assert!(matches!(
            DirectoryCatalog::new(&store).list("/nope"),
            Err(StoreError::NotFound(_))
        ));
    }
}
