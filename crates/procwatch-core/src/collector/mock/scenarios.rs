//! Pre-built `/proc/[pid]` contents for tests.

use super::filesystem::MockFs;

/// A `/proc/[pid]/io` block with fixed counters.
pub const IO_BLOCK: &str = "\
rchar: 1000000
wchar: 250000
syscr: 3000
syscw: 1200
read_bytes: 4096
write_bytes: 8192
cancelled_write_bytes: 0
";

/// Builds a `/proc/[pid]/status` block for a user process.
pub fn status_block(pid: u32, name: &str) -> String {
    format!(
        "\
Name:\t{name}
Umask:\t0022
State:\tS (sleeping)
Tgid:\t{pid}
Ngid:\t0
Pid:\t{pid}
PPid:\t1
VmPeak:\t  220000 kB
VmSize:\t  215000 kB
VmRSS:\t   41000 kB
RssAnon:\t   12000 kB
RssFile:\t   29000 kB
RssShmem:\t       0 kB
Threads:\t4
voluntary_ctxt_switches:\t1500
nonvoluntary_ctxt_switches:\t42
"
    )
}

/// Builds a `/proc/[pid]/stat` line with the given CPU ticks.
///
/// Fault counts are fixed at minflt=5000, majflt=10 and num_threads at 4.
pub fn stat_line(pid: u32, comm: &str, utime_ticks: u64, stime_ticks: u64) -> String {
    format!(
        "{pid} ({comm}) S 1 {pid} {pid} 0 -1 4194304 5000 0 10 0 {utime_ticks} {stime_ticks} 0 0 20 0 4 0 100000 220160000 10250 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0 0 0 0 0 0 0 0 0"
    )
}

impl MockFs {
    /// A single user process `worker` with pid 4242, 150 user and 30 system ticks.
    pub fn single_process() -> Self {
        let fs = Self::new();
        fs.add_process(
            4242,
            &status_block(4242, "worker"),
            IO_BLOCK,
            &stat_line(4242, "worker", 150, 30),
        );
        fs
    }

    /// Replaces the stat line of `pid` with new CPU tick counts.
    pub fn set_cpu_ticks(&self, pid: u32, comm: &str, utime_ticks: u64, stime_ticks: u64) {
        self.add_file(
            format!("/proc/{}/stat", pid),
            stat_line(pid, comm, utime_ticks, stime_ticks),
        );
    }
}
