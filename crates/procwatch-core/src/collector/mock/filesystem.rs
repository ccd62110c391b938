//! In-memory mock filesystem for testing the sampler without a real `/proc`.
//!
//! Clones share the same tree, so a test can keep one handle and remove a
//! process while a watch loop samples through another.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::collector::traits::FileSystem;

#[derive(Debug, Default)]
struct Tree {
    /// Map from path to file contents.
    files: HashMap<PathBuf, String>,
    directories: HashSet<PathBuf>,
    /// Paths that fail with `PermissionDenied`.
    denied: HashSet<PathBuf>,
    /// Paths that fail with a raw OS error code.
    os_errors: HashMap<PathBuf, i32>,
}

/// In-memory filesystem for testing.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    tree: Arc<RwLock<Tree>>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    fn read_tree(&self) -> RwLockReadGuard<'_, Tree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tree(&self) -> RwLockWriteGuard<'_, Tree> {
        self.tree.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds or replaces a file. Parent directories are created.
    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        let mut tree = self.write_tree();
        insert_parents(&mut tree.directories, &path);
        tree.files.insert(path, content.into());
    }

    /// Adds an empty directory.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut tree = self.write_tree();
        insert_parents(&mut tree.directories, &path);
        tree.directories.insert(path);
    }

    /// Makes reads of `path` fail with `PermissionDenied`.
    pub fn deny(&self, path: impl AsRef<Path>) {
        self.write_tree().denied.insert(path.as_ref().to_path_buf());
    }

    /// Makes reads of `path` fail with the OS error `code` (3 is `ESRCH`).
    pub fn fail_with_os_error(&self, path: impl AsRef<Path>, code: i32) {
        self.write_tree()
            .os_errors
            .insert(path.as_ref().to_path_buf(), code);
    }

    /// Adds a process with the three files the sampler reads.
    ///
    /// # Arguments
    /// * `pid` - Process ID
    /// * `status` - Content of `/proc/[pid]/status`
    /// * `io` - Content of `/proc/[pid]/io`
    /// * `stat` - Content of `/proc/[pid]/stat`
    pub fn add_process(&self, pid: u32, status: &str, io: &str, stat: &str) {
        let base = PathBuf::from(format!("/proc/{}", pid));
        self.add_dir(&base);
        self.add_file(base.join("status"), status);
        self.add_file(base.join("io"), io);
        self.add_file(base.join("stat"), stat);
    }

    /// Removes `/proc/[pid]` and everything below it, as when a process exits.
    pub fn remove_process(&self, pid: u32) {
        let base = PathBuf::from(format!("/proc/{}", pid));
        let mut tree = self.write_tree();
        tree.files.retain(|path, _| !path.starts_with(&base));
        tree.directories.retain(|path| !path.starts_with(&base));
    }
}

fn insert_parents(directories: &mut HashSet<PathBuf>, path: &Path) {
    let mut parent = path.parent();
    while let Some(p) = parent {
        if !p.as_os_str().is_empty() {
            directories.insert(p.to_path_buf());
        }
        parent = p.parent();
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let tree = self.read_tree();
        if tree.denied.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("permission denied: {:?}", path),
            ));
        }
        if let Some(&code) = tree.os_errors.get(path) {
            return Err(io::Error::from_raw_os_error(code));
        }
        tree.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        let tree = self.read_tree();
        tree.files.contains_key(path) || tree.directories.contains(path)
    }
}
