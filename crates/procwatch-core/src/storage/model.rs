//! The stored sample of one watched process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Names of the cumulative counters, in the order returned by
/// [`Snapshot::counters`].
pub const COUNTER_NAMES: [&str; 12] = [
    "rchar",
    "wchar",
    "syscr",
    "syscw",
    "read_bytes",
    "write_bytes",
    "voluntary_ctxt_switches",
    "nonvoluntary_ctxt_switches",
    "minor_faults",
    "major_faults",
    "utime_microseconds",
    "stime_microseconds",
];

/// One sample of a process, taken at `timestamp`.
///
/// Source: `/proc/[pid]/status`, `/proc/[pid]/io`, `/proc/[pid]/stat`.
///
/// Memory gauges are in kilobytes. I/O, context-switch, fault and CPU-time
/// fields are cumulative since process start.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct Snapshot {
    /// Source: `/proc/[pid]/status` (Name)
    pub name: String,
    pub pid: u32,
    pub ppid: u32,
    pub timestamp: DateTime<Utc>,

    /// Source: `/proc/[pid]/status` (RssAnon)
    pub rss_anon_kb: u64,
    /// Source: `/proc/[pid]/status` (RssFile)
    pub rss_file_kb: u64,
    /// Source: `/proc/[pid]/status` (VmSize)
    pub vm_size_kb: u64,

    /// Bytes passed to read-like syscalls.
    /// Source: `/proc/[pid]/io` (rchar)
    pub rchar: u64,
    /// Bytes passed to write-like syscalls.
    /// Source: `/proc/[pid]/io` (wchar)
    pub wchar: u64,
    pub syscr: u64,
    pub syscw: u64,
    /// Bytes actually fetched from the storage layer.
    pub read_bytes: u64,
    /// Bytes actually sent to the storage layer.
    pub write_bytes: u64,

    pub voluntary_ctxt_switches: u64,
    pub nonvoluntary_ctxt_switches: u64,

    /// Source: `/proc/[pid]/stat` field 10 (minflt)
    pub minor_faults: u64,
    /// Source: `/proc/[pid]/stat` field 12 (majflt)
    pub major_faults: u64,

    /// User-mode CPU time. Source: `/proc/[pid]/stat` field 14 (utime), converted from ticks.
    pub utime_microseconds: u64,
    /// Kernel-mode CPU time. Source: `/proc/[pid]/stat` field 15 (stime), converted from ticks.
    pub stime_microseconds: u64,

    /// Source: `/proc/[pid]/stat` field 20 (num_threads)
    pub num_threads: u32,
}

impl Snapshot {
    /// Cumulative counters in [`COUNTER_NAMES`] order.
    pub fn counters(&self) -> [u64; 12] {
        [
            self.rchar,
            self.wchar,
            self.syscr,
            self.syscw,
            self.read_bytes,
            self.write_bytes,
            self.voluntary_ctxt_switches,
            self.nonvoluntary_ctxt_switches,
            self.minor_faults,
            self.major_faults,
            self.utime_microseconds,
            self.stime_microseconds,
        ]
    }

    /// Returns the name of the first cumulative counter that is lower than in
    /// `prev`, or `None` if every counter held or grew.
    ///
    /// A regression means the pid now belongs to a different process instance.
    pub fn first_counter_regression(&self, prev: &Snapshot) -> Option<&'static str> {
        self.counters()
            .iter()
            .zip(prev.counters().iter())
            .zip(COUNTER_NAMES)
            .find(|((curr, prev), _)| curr < prev)
            .map(|(_, name)| name)
    }

    pub fn counters_monotonic_since(&self, prev: &Snapshot) -> bool {
        self.first_counter_regression(prev).is_none()
    }

    /// Milliseconds since the Unix epoch.
    pub fn epoch_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn with_counters(counters: [u64; 12]) -> Snapshot {
        let [
            rchar,
            wchar,
            syscr,
            syscw,
            read_bytes,
            write_bytes,
            voluntary_ctxt_switches,
            nonvoluntary_ctxt_switches,
            minor_faults,
            major_faults,
            utime_microseconds,
            stime_microseconds,
        ] = counters;
        Snapshot {
            rchar,
            wchar,
            syscr,
            syscw,
            read_bytes,
            write_bytes,
            voluntary_ctxt_switches,
            nonvoluntary_ctxt_switches,
            minor_faults,
            major_faults,
            utime_microseconds,
            stime_microseconds,
            ..Snapshot::default()
        }
    }

    #[test]
    fn test_counters_order_matches_names() {
        let snapshot = with_counters([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(snapshot.counters()[0], snapshot.rchar);
        assert_eq!(snapshot.counters()[10], snapshot.utime_microseconds);
        assert_eq!(COUNTER_NAMES[10], "utime_microseconds");
    }

    #[test]
    fn test_first_counter_regression() {
        let prev = with_counters([10; 12]);
        let mut curr = with_counters([10; 12]);
        assert_eq!(curr.first_counter_regression(&prev), None);

        curr.major_faults = 9;
        assert_eq!(curr.first_counter_regression(&prev), Some("major_faults"));
        assert!(!curr.counters_monotonic_since(&prev));
    }

    #[test]
    fn test_epoch_ms() {
        let snapshot = Snapshot {
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
            ..Snapshot::default()
        };
        assert_eq!(snapshot.epoch_ms(), 1_700_000_000_123);
    }

    proptest! {
        // Synthetic sequences built from non-negative increments never regress.
        #[test]
        fn prop_increasing_sequences_are_monotonic(
            start in prop::array::uniform12(0u64..1_000_000),
            steps in prop::collection::vec(prop::array::uniform12(0u64..10_000), 1..32),
        ) {
            let mut counters = start;
            let mut prev = with_counters(counters);
            for step in steps {
                for (counter, inc) in counters.iter_mut().zip(step) {
                    *counter += inc;
                }
                let curr = with_counters(counters);
                prop_assert!(curr.counters_monotonic_since(&prev));
                prev = curr;
            }
        }

        #[test]
        fn prop_any_decrease_is_reported(
            base in prop::array::uniform12(1u64..1_000_000),
            idx in 0usize..12,
        ) {
            let prev = with_counters(base);
            let mut lowered = base;
            lowered[idx] -= 1;
            let curr = with_counters(lowered);
            prop_assert_eq!(curr.first_counter_regression(&prev), Some(COUNTER_NAMES[idx]));
        }
    }
}
