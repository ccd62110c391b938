//! Append-only sample store.
//!
//! Snapshots are kept in memory per pid, sorted by timestamp, and made
//! durable by a write-ahead log in the data directory:
//!
//! ```text
//! samples.wal
//! ┌──────────┬──────────┬─────────────────────────┐
//! │ len: u32 │ crc: u32 │ bincode(Snapshot)       │  × N
//! └──────────┴──────────┴─────────────────────────┘
//! ```
//!
//! The log record is written (and synced) before the snapshot becomes
//! visible to readers. On open the log is replayed; a torn or corrupt tail
//! left by a crash is truncated. Frames are written at the end of the last
//! good frame, and a failed write is cut back off the log. If that cut fails
//! the store refuses further inserts.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::storage::model::Snapshot;

pub const WAL_FILE_NAME: &str = "samples.wal";

const FRAME_HEADER_LEN: usize = 8;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] bincode::Error),
    #[error("snapshot too large for a WAL frame: {0} bytes")]
    FrameTooLarge(usize),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("store is closed")]
    Closed,
    #[error("write-ahead log {0} could not be rolled back after a failed write")]
    WalBroken(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The file operations the log needs; a seam for failure tests.
trait LogFile: Send {
    /// Writes `buf` starting at byte `offset`.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn sync_data(&mut self) -> io::Result<()>;
    fn sync_all(&mut self) -> io::Result<()>;
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)
    }

    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn sync_all(&mut self) -> io::Result<()> {
        File::sync_all(self)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

struct Wal {
    path: PathBuf,
    file: Box<dyn LogFile>,
    /// End of the last fully written frame.
    len: u64,
}

/// Why an append failed, and whether the log is still usable.
enum AppendError {
    /// Nothing of the frame remains in the log.
    RolledBack(StoreError),
    /// The log may end in a partial frame.
    Broken(StoreError),
}

impl Wal {
    fn append(&mut self, snapshot: &Snapshot) -> Result<(), AppendError> {
        let payload = bincode::serialize(snapshot)
            .map_err(|e| AppendError::RolledBack(StoreError::Encode(e)))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| AppendError::RolledBack(StoreError::FrameTooLarge(payload.len())))?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        let written = self
            .file
            .write_at(self.len, &frame)
            .and_then(|()| self.file.sync_data());
        if let Err(source) = written {
            let err = io_error(&self.path)(source);
            return match self.file.set_len(self.len) {
                Ok(()) => Err(AppendError::RolledBack(err)),
                Err(rollback) => {
                    warn!(
                        path = %self.path.display(),
                        error = %rollback,
                        "WAL rollback failed"
                    );
                    Err(AppendError::Broken(err))
                }
            };
        }
        self.len += frame.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.file.sync_all().map_err(io_error(&self.path))
    }
}

enum WalState {
    /// No persistence (tests, throwaway stores).
    Memory,
    Open(Wal),
    Closed,
    /// A failed write could not be rolled back.
    Broken(PathBuf),
}

/// Append-only time series of [`Snapshot`]s keyed by (pid, timestamp).
///
/// One writer and any number of readers may use the store concurrently
/// through a shared reference.
pub struct Store {
    index: RwLock<HashMap<u32, Vec<Snapshot>>>,
    wal: Mutex<WalState>,
}

impl Store {
    /// Opens (or creates) a store in `dir`, replaying its write-ahead log.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(io_error(dir))?;

        let path = dir.join(WAL_FILE_NAME);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(io_error(&path)(e)),
        };
        let (snapshots, valid_len) = replay_wal(&data);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(io_error(&path))?;

        if (valid_len as usize) < data.len() {
            warn!(
                path = %path.display(),
                garbage_bytes = data.len() - valid_len as usize,
                valid_records = snapshots.len(),
                "WAL corruption detected, truncating"
            );
            file.set_len(valid_len).map_err(io_error(&path))?;
        }

        let mut index: HashMap<u32, Vec<Snapshot>> = HashMap::new();
        let recovered = snapshots.len();
        for snapshot in snapshots {
            insert_sorted(&mut index, snapshot);
        }
        info!(
            path = %path.display(),
            recovered,
            pids = index.len(),
            "store opened"
        );

        Ok(Self::with_wal(
            index,
            Wal {
                path,
                file: Box::new(file),
                len: valid_len,
            },
        ))
    }

    fn with_wal(index: HashMap<u32, Vec<Snapshot>>, wal: Wal) -> Self {
        Self {
            index: RwLock::new(index),
            wal: Mutex::new(WalState::Open(wal)),
        }
    }

    /// Creates a store without persistence.
    pub fn in_memory() -> Self {
        Self {
            index: RwLock::new(HashMap::new()),
            wal: Mutex::new(WalState::Memory),
        }
    }

    /// Appends one snapshot.
    ///
    /// The snapshot is logged before it is indexed, so readers never see a
    /// sample that would be lost on restart.
    pub fn insert(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        // The WAL lock is held while indexing so that index order among equal
        // timestamps matches log order.
        let mut wal = self.wal.lock().map_err(|_| StoreError::Poisoned)?;
        match &mut *wal {
            WalState::Memory => {}
            WalState::Open(open) => match open.append(&snapshot) {
                Ok(()) => {}
                Err(AppendError::RolledBack(err)) => return Err(err),
                Err(AppendError::Broken(err)) => {
                    let path = open.path.clone();
                    *wal = WalState::Broken(path);
                    return Err(err);
                }
            },
            WalState::Closed => return Err(StoreError::Closed),
            WalState::Broken(path) => return Err(StoreError::WalBroken(path.clone())),
        }

        let mut index = self.index.write().map_err(|_| StoreError::Poisoned)?;
        debug!(pid = snapshot.pid, timestamp = %snapshot.timestamp, "snapshot stored");
        insert_sorted(&mut index, snapshot);
        Ok(())
    }

    /// Returns snapshots of `pid` with `from <= timestamp < until`, ascending.
    ///
    /// `until = None` means no upper bound. Equal timestamps keep insertion order.
    pub fn range(
        &self,
        pid: u32,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let index = self.index.read().map_err(|_| StoreError::Poisoned)?;
        let Some(series) = index.get(&pid) else {
            return Ok(Vec::new());
        };

        let lo = series.partition_point(|s| s.timestamp < from);
        let hi = until.map_or(series.len(), |until| {
            series.partition_point(|s| s.timestamp < until)
        });
        Ok(series[lo..hi.max(lo)].to_vec())
    }

    /// Most recent snapshot of `pid`.
    pub fn latest(&self, pid: u32) -> Result<Option<Snapshot>, StoreError> {
        let index = self.index.read().map_err(|_| StoreError::Poisoned)?;
        Ok(index.get(&pid).and_then(|series| series.last().cloned()))
    }

    pub fn count(&self, pid: u32) -> Result<usize, StoreError> {
        let index = self.index.read().map_err(|_| StoreError::Poisoned)?;
        Ok(index.get(&pid).map_or(0, Vec::len))
    }

    /// All pids with at least one snapshot, with their sample counts, ascending by pid.
    pub fn pids(&self) -> Result<Vec<(u32, usize)>, StoreError> {
        let index = self.index.read().map_err(|_| StoreError::Poisoned)?;
        let mut pids: Vec<(u32, usize)> = index
            .iter()
            .map(|(pid, series)| (*pid, series.len()))
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    /// Size of the write-ahead log in bytes; `None` for in-memory stores.
    pub fn wal_len(&self) -> Option<u64> {
        match &*self.wal.lock().ok()? {
            WalState::Open(wal) => Some(wal.len),
            WalState::Memory | WalState::Closed | WalState::Broken(_) => None,
        }
    }

    /// Flushes and syncs the log. Later inserts fail with [`StoreError::Closed`];
    /// reads keep working.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut wal = self.wal.lock().map_err(|_| StoreError::Poisoned)?;
        if let WalState::Open(open) = &mut *wal {
            open.close()?;
            info!(path = %open.path.display(), bytes = open.len, "store closed");
        }
        *wal = WalState::Closed;
        Ok(())
    }
}

fn insert_sorted(index: &mut HashMap<u32, Vec<Snapshot>>, snapshot: Snapshot) {
    let series = index.entry(snapshot.pid).or_default();
    let pos = series.partition_point(|s| s.timestamp <= snapshot.timestamp);
    series.insert(pos, snapshot);
}

/// Decodes WAL frames until the first incomplete or corrupt one.
///
/// Returns the decoded snapshots and the byte length of the valid prefix.
fn replay_wal(data: &[u8]) -> (Vec<Snapshot>, u64) {
    let mut snapshots = Vec::new();
    let mut pos = 0usize;

    while let Some(header) = data.get(pos..pos + FRAME_HEADER_LEN) {
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let start = pos + FRAME_HEADER_LEN;
        let Some(payload) = data.get(start..start + len) else {
            break;
        };
        if crc32fast::hash(payload) != crc {
            break;
        }
        let Ok(snapshot) = bincode::deserialize::<Snapshot>(payload) else {
            break;
        };

        snapshots.push(snapshot);
        pos = start + len;
    }

    (snapshots, pos as u64)
}
