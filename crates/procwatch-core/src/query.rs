//! Range queries that turn cumulative counters into rates.
//!
//! Each output sample is differenced against the stored snapshot immediately
//! before it. To give the first sample of a range a predecessor, rows are
//! fetched from `start - lookback`; those seed rows are dropped from the
//! result. A row with no predecessor in the fetched set yields nothing.
//!
//! CPU percentages are `100 * Δcpu_us / Δwall_us` and are not clamped: a
//! process running on several cores exceeds 100.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::QueryConfig;
use crate::storage::{Snapshot, Store, StoreError};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid time range: end {end} is before start {start}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("timestamp out of range: {0} ms")]
    InvalidTimestamp(i64),
    #[error("store query failed: {0}")]
    Store(#[from] StoreError),
}

/// One query result row: gauges passed through, CPU counters turned into rates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedSample {
    pub timestamp: DateTime<Utc>,
    pub rss_anon_kb: u64,
    pub rss_file_kb: u64,
    pub vm_size_kb: u64,
    /// User CPU time as a percentage of wall time since the previous sample.
    pub utime_pct: f64,
    /// Kernel CPU time as a percentage of wall time since the previous sample.
    pub stime_pct: f64,
    pub minor_faults: u64,
    pub major_faults: u64,
    pub num_threads: u32,
    pub rchar: u64,
    pub wchar: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl DerivedSample {
    /// Derives the row for `curr` from its immediate predecessor `prev`.
    pub fn between(prev: &Snapshot, curr: &Snapshot) -> Self {
        let elapsed_us = (curr.timestamp - prev.timestamp)
            .num_microseconds()
            .unwrap_or(0);

        Self {
            timestamp: curr.timestamp,
            rss_anon_kb: curr.rss_anon_kb,
            rss_file_kb: curr.rss_file_kb,
            vm_size_kb: curr.vm_size_kb,
            utime_pct: cpu_pct(
                delta(curr.utime_microseconds, prev.utime_microseconds),
                elapsed_us,
            ),
            stime_pct: cpu_pct(
                delta(curr.stime_microseconds, prev.stime_microseconds),
                elapsed_us,
            ),
            minor_faults: curr.minor_faults,
            major_faults: curr.major_faults,
            num_threads: curr.num_threads,
            rchar: curr.rchar,
            wchar: curr.wchar,
            read_bytes: curr.read_bytes,
            write_bytes: curr.write_bytes,
        }
    }
}

/// Wire shape of a query result row, as served to chart clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct MetricPoint {
    pub epoch_ms: i64,
    pub rss_anon_kb: u64,
    pub vm_size_kb: u64,
    pub utime_pct: f64,
    pub stime_pct: f64,
    pub minor_faults: u64,
    pub major_faults: u64,
    pub num_threads: u32,
    pub rchar: u64,
    pub wchar: u64,
}

impl From<&DerivedSample> for MetricPoint {
    fn from(sample: &DerivedSample) -> Self {
        Self {
            epoch_ms: sample.timestamp.timestamp_millis(),
            rss_anon_kb: sample.rss_anon_kb,
            vm_size_kb: sample.vm_size_kb,
            utime_pct: sample.utime_pct,
            stime_pct: sample.stime_pct,
            minor_faults: sample.minor_faults,
            major_faults: sample.major_faults,
            num_threads: sample.num_threads,
            rchar: sample.rchar,
            wchar: sample.wchar,
        }
    }
}

/// Signed counter delta. Negative only across a pid reuse.
fn delta(curr: u64, prev: u64) -> f64 {
    curr as f64 - prev as f64
}

/// `100 * delta_us / elapsed_us`, or 0 when no wall time elapsed.
pub fn cpu_pct(delta_us: f64, elapsed_us: i64) -> f64 {
    if elapsed_us > 0 {
        100.0 * delta_us / elapsed_us as f64
    } else {
        0.0
    }
}

/// Orders `rows` by timestamp (stable) and derives a sample for every row at or
/// after `start` that has a predecessor.
pub fn derive_samples(mut rows: Vec<Snapshot>, start: DateTime<Utc>) -> Vec<DerivedSample> {
    rows.sort_by_key(|s| s.timestamp);
    rows.windows(2)
        .filter(|pair| pair[1].timestamp >= start)
        .map(|pair| DerivedSample::between(&pair[0], &pair[1]))
        .collect()
}

fn from_epoch_ms(ms: i64) -> Result<DateTime<Utc>, QueryError> {
    DateTime::from_timestamp_millis(ms).ok_or(QueryError::InvalidTimestamp(ms))
}

/// Read-only query front end over a shared [`Store`].
pub struct QueryEngine {
    store: Arc<Store>,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(store: Arc<Store>, config: QueryConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Derived samples of `pid` in `[start, end)`, ascending by timestamp.
    pub fn derive(
        &self,
        pid: u32,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<DerivedSample>, QueryError> {
        if let Some(end) = end
            && end < start
        {
            return Err(QueryError::InvalidRange { start, end });
        }

        let t0 = Instant::now();
        let from = start
            .checked_sub_signed(self.config.lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let rows = self.store.range(pid, from, end)?;
        let fetched = rows.len();
        let samples = derive_samples(rows, start);

        debug!(
            pid,
            %start,
            end = ?end,
            fetched,
            derived = samples.len(),
            duration_us = t0.elapsed().as_micros() as u64,
            "query completed"
        );
        Ok(samples)
    }

    /// Query surface in epoch milliseconds.
    ///
    /// A missing `start_ms` means the last `default_window` up to now; a
    /// missing `end_ms` means no upper bound.
    pub fn metrics(
        &self,
        pid: u32,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<MetricPoint>, QueryError> {
        self.metrics_at(pid, start_ms, end_ms, Utc::now())
    }

    /// Same as [`Self::metrics`] with an explicit "now".
    pub fn metrics_at(
        &self,
        pid: u32,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>, QueryError> {
        let start = match start_ms {
            Some(ms) => from_epoch_ms(ms)?,
            None => now
                .checked_sub_signed(self.config.default_window)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        };
        let end = end_ms.map(from_epoch_ms).transpose()?;

        Ok(self
            .derive(pid, start, end)?
            .iter()
            .map(MetricPoint::from)
            .collect())
    }
}
