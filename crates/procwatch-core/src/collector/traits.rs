//! Abstractions for filesystem access to enable testing and mocking.
//!
//! The `FileSystem` trait lets the sampler read from the real `/proc`
//! filesystem on Linux or from an in-memory tree in tests and on other platforms.

use std::io;
use std::path::Path;

/// Abstraction for the filesystem operations the sampler needs.
///
/// Implementations must be shareable across threads: the watch loop moves
/// reads onto the blocking pool.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    ///
    /// A missing file must be reported as [`io::ErrorKind::NotFound`]; the
    /// sampler relies on that kind to detect a process that has exited.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Checks if a path exists.
    fn exists(&self, path: &Path) -> bool;
}

/// Real filesystem implementation that delegates to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}
