//! Sampler for one process: reads `/proc/[pid]/{status,io,stat}` into a [`Snapshot`].

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::trace;

use crate::collector::procfs::parser::{
    ParseError, ProcIo, ProcStat, ProcStatus, parse_proc_io, parse_proc_stat, parse_proc_status,
};
use crate::collector::traits::FileSystem;
use crate::storage::Snapshot;

/// Clock ticks per second (USER_HZ) assumed when converting CPU times.
///
/// This is not queried from the OS. Kernels built with a different USER_HZ
/// need `Sampler::with_clock_tick_rate`.
pub const DEFAULT_CLOCK_TICK_RATE: u64 = 100;

const MICROS_PER_SECOND: u64 = 1_000_000;

/// "No such process": reads under `/proc/[pid]` can return this once the
/// process has exited but its directory is still open.
const ESRCH: i32 = 3;

/// Error type for sampling failures.
#[derive(Debug, Error)]
pub enum SampleError {
    /// The process no longer exists. Expected at the end of every watch.
    #[error("process {0} is gone")]
    ProcessGone(u32),
    /// I/O error other than a missing file (e.g. permission denied on `io`).
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse sample of pid {pid}: {source}")]
    Parse {
        pid: u32,
        #[source]
        source: ParseError,
    },
}

impl SampleError {
    pub fn is_process_gone(&self) -> bool {
        matches!(self, SampleError::ProcessGone(_))
    }
}

/// Takes snapshots of a process from `/proc/[pid]/` files.
pub struct Sampler<F: FileSystem> {
    fs: F,
    proc_path: PathBuf,
    clock_tick_rate: u64,
}

impl<F: FileSystem> Sampler<F> {
    /// Creates a sampler.
    ///
    /// # Arguments
    /// * `fs` - Filesystem implementation (real or mock)
    /// * `proc_path` - Base path to proc filesystem (usually "/proc")
    pub fn new(fs: F, proc_path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
            clock_tick_rate: DEFAULT_CLOCK_TICK_RATE,
        }
    }

    /// Overrides the clock tick rate used to convert CPU ticks to microseconds.
    ///
    /// Rates of zero are treated as one tick per second.
    pub fn with_clock_tick_rate(mut self, clock_tick_rate: u64) -> Self {
        self.clock_tick_rate = clock_tick_rate.max(1);
        self
    }

    pub fn clock_tick_rate(&self) -> u64 {
        self.clock_tick_rate
    }

    pub fn proc_path(&self) -> &Path {
        &self.proc_path
    }

    /// Converts clock ticks to microseconds: `ticks * (1_000_000 / clock_tick_rate)`.
    pub fn ticks_to_micros(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(MICROS_PER_SECOND / self.clock_tick_rate)
    }

    /// Returns true while `/proc/[pid]` exists.
    pub fn is_alive(&self, pid: u32) -> bool {
        self.fs.exists(&self.proc_path.join(pid.to_string()))
    }

    /// Samples `pid`, stamping the snapshot with the time the reads completed.
    pub fn sample(&self, pid: u32) -> Result<Snapshot, SampleError> {
        let (status, io, stat) = self.read_sources(pid)?;
        Ok(self.build(status, io, stat, Utc::now()))
    }

    /// Samples `pid` with an explicit timestamp (for testing or replay).
    pub fn sample_at(&self, pid: u32, timestamp: DateTime<Utc>) -> Result<Snapshot, SampleError> {
        let (status, io, stat) = self.read_sources(pid)?;
        Ok(self.build(status, io, stat, timestamp))
    }

    fn read_sources(&self, pid: u32) -> Result<(ProcStatus, ProcIo, ProcStat), SampleError> {
        let parse = |source: ParseError| SampleError::Parse { pid, source };

        let status = parse_proc_status(&self.read(pid, "status")?).map_err(parse)?;
        let io = parse_proc_io(&self.read(pid, "io")?).map_err(parse)?;
        let stat = parse_proc_stat(&self.read(pid, "stat")?).map_err(parse)?;

        Ok((status, io, stat))
    }

    fn read(&self, pid: u32, file: &str) -> Result<String, SampleError> {
        let path = self.proc_path.join(pid.to_string()).join(file);
        trace!(path = %path.display(), "reading");
        self.fs.read_to_string(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound || source.raw_os_error() == Some(ESRCH) {
                SampleError::ProcessGone(pid)
            } else {
                SampleError::Io { path, source }
            }
        })
    }

    fn build(
        &self,
        status: ProcStatus,
        io: ProcIo,
        stat: ProcStat,
        timestamp: DateTime<Utc>,
    ) -> Snapshot {
        Snapshot {
            name: status.name,
            pid: status.pid,
            ppid: status.ppid,
            timestamp,
            rss_anon_kb: status.rss_anon_kb,
            rss_file_kb: status.rss_file_kb,
            vm_size_kb: status.vm_size_kb,
            rchar: io.rchar,
            wchar: io.wchar,
            syscr: io.syscr,
            syscw: io.syscw,
            read_bytes: io.read_bytes,
            write_bytes: io.write_bytes,
            voluntary_ctxt_switches: status.voluntary_ctxt_switches,
            nonvoluntary_ctxt_switches: status.nonvoluntary_ctxt_switches,
            minor_faults: stat.minor_faults,
            major_faults: stat.major_faults,
            utime_microseconds: self.ticks_to_micros(stat.utime_ticks),
            stime_microseconds: self.ticks_to_micros(stat.stime_ticks),
            num_threads: stat.num_threads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    #[test]
    fn test_sample_single_process() {
        let fs = MockFs::single_process();
        let sampler = Sampler::new(fs, "/proc");

        let snapshot = sampler.sample(4242).unwrap();

        assert_eq!(snapshot.name, "worker");
        assert_eq!(snapshot.pid, 4242);
        assert_eq!(snapshot.ppid, 1);
        assert_eq!(snapshot.rss_anon_kb, 12000);
        assert_eq!(snapshot.rss_file_kb, 29000);
        assert_eq!(snapshot.vm_size_kb, 215000);
        assert_eq!(snapshot.rchar, 1_000_000);
        assert_eq!(snapshot.write_bytes, 8192);
        assert_eq!(snapshot.voluntary_ctxt_switches, 1500);
        assert_eq!(snapshot.minor_faults, 5000);
        assert_eq!(snapshot.major_faults, 10);
        // 150 and 30 ticks at 100 Hz.
        assert_eq!(snapshot.utime_microseconds, 1_500_000);
        assert_eq!(snapshot.stime_microseconds, 300_000);
        assert_eq!(snapshot.num_threads, 4);
    }

    #[test]
    fn test_sample_at_uses_given_timestamp() {
        let sampler = Sampler::new(MockFs::single_process(), "/proc");
        let ts = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        let snapshot = sampler.sample_at(4242, ts).unwrap();
        assert_eq!(snapshot.timestamp, ts);
    }

    #[test]
    fn test_clock_tick_rate_conversion() {
        let sampler = Sampler::new(MockFs::single_process(), "/proc").with_clock_tick_rate(250);
        assert_eq!(sampler.ticks_to_micros(250), 1_000_000);

        let snapshot = sampler.sample(4242).unwrap();
        assert_eq!(snapshot.utime_microseconds, 150 * 4_000);
    }

    #[test]
    fn test_zero_clock_tick_rate_is_clamped() {
        let sampler = Sampler::new(MockFs::new(), "/proc").with_clock_tick_rate(0);
        assert_eq!(sampler.clock_tick_rate(), 1);
        assert_eq!(sampler.ticks_to_micros(2), 2_000_000);
    }

    #[test]
    fn test_sample_process_gone() {
        let fs = MockFs::new();
        fs.add_dir("/proc/9999");

        let sampler = Sampler::new(fs, "/proc");
        let result = sampler.sample(9999);

        assert!(matches!(result, Err(SampleError::ProcessGone(9999))));
    }

    #[test]
    fn test_sample_process_gone_after_removal() {
        let fs = MockFs::single_process();
        let sampler = Sampler::new(fs.clone(), "/proc");
        assert!(sampler.is_alive(4242));

        fs.remove_process(4242);

        assert!(!sampler.is_alive(4242));
        assert!(sampler.sample(4242).unwrap_err().is_process_gone());
    }

    #[test]
    fn test_sample_esrch_is_process_gone() {
        let fs = MockFs::single_process();
        fs.fail_with_os_error("/proc/4242/stat", ESRCH);

        let sampler = Sampler::new(fs, "/proc");

        assert!(matches!(
            sampler.sample(4242),
            Err(SampleError::ProcessGone(4242))
        ));
    }

    #[test]
    fn test_sample_permission_denied_is_failure() {
        let fs = MockFs::single_process();
        fs.deny("/proc/4242/io");

        let sampler = Sampler::new(fs, "/proc");
        let err = sampler.sample(4242).unwrap_err();

        assert!(!err.is_process_gone());
        assert!(matches!(err, SampleError::Io { ref path, .. } if path.ends_with("io")));
    }

    #[test]
    fn test_sample_malformed_stat_is_failure() {
        let fs = MockFs::single_process();
        fs.add_file("/proc/4242/stat", "4242 (worker) S 1");

        let sampler = Sampler::new(fs, "/proc");
        let err = sampler.sample(4242).unwrap_err();

        assert!(matches!(
            err,
            SampleError::Parse {
                pid: 4242,
                source: ParseError::MalformedStat(_)
            }
        ));
    }
}
