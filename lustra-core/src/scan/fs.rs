//! Minimal async filesystem seam used by the reconciliation scanner.
//!
//! The real implementation is backed by `tokio::fs`; the in-memory one lets
//! scheduler tests mutate a synthetic tree between ticks without touching
//! disk.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;

/// Lightweight metadata the scanner needs.
#[derive(Clone, Copy, Debug)]
pub struct FsMetadata {
    pub is_dir: bool,
    pub is_file: bool,
    pub len: u64,
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn path_exists(&self, path: &Path) -> bool;

    async fn metadata(&self, path: &Path) -> Result<FsMetadata>;

    /// Entries of a directory, in no particular order.
    async fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

/// Enumerate every file under `root`, breadth-first. Directories that fail
/// to read mid-walk are logged and skipped; a missing or unreadable root is
/// an error (the library root disappearing is not something to paper over).
pub async fn walk_files(fs: &dyn FileSystem, root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(root.to_path_buf());
    let mut first = true;

    while let Some(dir) = queue.pop_front() {
        let entries = match fs.read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if first => return Err(err),
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "skipping unreadable directory");
                continue;
            }
        };
        first = false;

        for entry in entries {
            match fs.metadata(&entry).await {
                Ok(meta) if meta.is_dir => queue.push_back(entry),
                Ok(meta) if meta.is_file => files.push(entry),
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %entry.display(), error = %err, "skipping unreadable entry");
                }
            }
        }
    }

    Ok(files)
}

/// Real filesystem backed by `tokio::fs`.
#[derive(Debug, Default)]
pub struct TokioFs;

impl TokioFs {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for TokioFs {
    async fn path_exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn metadata(&self, path: &Path) -> Result<FsMetadata> {
        let md = tokio::fs::metadata(path).await?;
        Ok(FsMetadata {
            is_dir: md.is_dir(),
            is_file: md.is_file(),
            len: md.len(),
        })
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut rd = tokio::fs::read_dir(path).await?;
        let mut entries = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            entries.push(entry.path());
        }
        Ok(entries)
    }
}

#[derive(Clone, Debug)]
enum Node {
    Dir { children: Vec<PathBuf> },
    File { len: u64 },
}

/// In-memory tree for tests. Paths are treated literally; use consistent
/// absolute paths. Mutations are allowed at any time, which is the point:
/// tests change the tree between scheduler ticks.
#[derive(Debug, Default)]
pub struct MemoryFs {
    nodes: RwLock<HashMap<PathBuf, Node>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut nodes = self.nodes.write().expect("memory fs lock");
        Self::link_parent(&mut nodes, &path);
        nodes.entry(path).or_insert(Node::Dir {
            children: Vec::new(),
        });
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, len: u64) {
        let path = path.into();
        let mut nodes = self.nodes.write().expect("memory fs lock");
        Self::link_parent(&mut nodes, &path);
        nodes.insert(path, Node::File { len });
    }

    pub fn remove_file(&self, path: &Path) {
        let mut nodes = self.nodes.write().expect("memory fs lock");
        nodes.remove(path);
        if let Some(parent) = path.parent()
            && let Some(Node::Dir { children }) = nodes.get_mut(parent)
        {
            children.retain(|child| child != path);
        }
    }

    pub fn rename_file(&self, from: &Path, to: impl Into<PathBuf>) {
        let to = to.into();
        let len = {
            let nodes = self.nodes.read().expect("memory fs lock");
            match nodes.get(from) {
                Some(Node::File { len }) => *len,
                _ => return,
            }
        };
        self.remove_file(from);
        self.add_file(to, len);
    }

    fn link_parent(nodes: &mut HashMap<PathBuf, Node>, path: &Path) {
        let Some(parent) = path.parent() else {
            return;
        };
        if !nodes.contains_key(parent) {
            nodes.insert(
                parent.to_path_buf(),
                Node::Dir {
                    children: Vec::new(),
                },
            );
            Self::link_parent(nodes, parent);
        }
        if let Some(Node::Dir { children }) = nodes.get_mut(parent)
            && !children.iter().any(|child| child == path)
        {
            children.push(path.to_path_buf());
        }
    }
}

#[async_trait]
impl FileSystem for MemoryFs {
    async fn path_exists(&self, path: &Path) -> bool {
        self.nodes.read().expect("memory fs lock").contains_key(path)
    }

    async fn metadata(&self, path: &Path) -> Result<FsMetadata> {
        match self.nodes.read().expect("memory fs lock").get(path) {
            Some(Node::Dir { .. }) => Ok(FsMetadata {
                is_dir: true,
                is_file: false,
                len: 0,
            }),
            Some(Node::File { len }) => Ok(FsMetadata {
                is_dir: false,
                is_file: true,
                len: *len,
            }),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such path: {}", path.display()),
            )
            .into()),
        }
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        match self.nodes.read().expect("memory fs lock").get(path) {
            Some(Node::Dir { children }) => Ok(children.clone()),
            Some(Node::File { .. }) => Err(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("not a directory: {}", path.display()),
            )
            .into()),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such directory: {}", path.display()),
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn walk_enumerates_nested_files() {
        let fs = MemoryFs::new();
        fs.add_file("/root/a/one.jpg", 10);
        fs.add_file("/root/a/b/two.jpg", 10);
        fs.add_file("/root/three.jpg", 10);
        fs.add_dir("/root/empty");

        let mut files = walk_files(&fs, Path::new("/root")).await.unwrap();
        files.sort();
        assert_eq!(
            files,
            vec![
                PathBuf::from("/root/a/b/two.jpg"),
                PathBuf::from("/root/a/one.jpg"),
                PathBuf::from("/root/three.jpg"),
            ]
        );
    }

    #[tokio::test]
    async fn walk_errors_on_missing_root() {
        let fs = MemoryFs::new();
        assert!(walk_files(&fs, Path::new("/nowhere")).await.is_err());
    }

    #[tokio::test]
    async fn removal_updates_the_tree() {
        let fs = MemoryFs::new();
        fs.add_file("/root/a/one.jpg", 10);
        fs.remove_file(Path::new("/root/a/one.jpg"));
        let files = walk_files(&fs, Path::new("/root")).await.unwrap();
        assert!(files.is_empty());
    }
}
