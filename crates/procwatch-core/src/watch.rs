//! Per-pid sampling loop.
//!
//! ```text
//!            ┌──────────── tick ────────────┐
//!            ▼                              │
//!       ┌─────────┐  sample + insert ok     │
//!  ───▶ │ Running │ ───────────────▶ sleep(interval)
//!       └─────────┘                         │ cancel
//!         │     │                           ▼
//!         │     └── ProcessGone ──▶ Terminated     Stopped
//!         └──── any other error ──▶ Failed (error returned)
//! ```
//!
//! A tick runs its file reads and the store write on the blocking pool, so
//! ticks of one loop never overlap. There is no retry and no backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::{FileSystem, SampleError, Sampler};
use crate::config::DEFAULT_INTERVAL;
use crate::storage::{Snapshot, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub enum WatchState {
    Running,
    /// The process exited; not an error.
    Terminated,
    /// The cancellation token fired.
    Stopped,
    Failed,
}

impl WatchState {
    pub fn is_finished(self) -> bool {
        !matches!(self, WatchState::Running)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("sampling pid {pid} failed: {source}")]
    SampleFailure {
        pid: u32,
        #[source]
        source: SampleError,
    },
    #[error("storing sample of pid {pid} failed: {source}")]
    StoreWriteFailure {
        pid: u32,
        #[source]
        source: StoreError,
    },
    #[error("sampling task for pid {pid} panicked or was cancelled: {source}")]
    Task {
        pid: u32,
        #[source]
        source: JoinError,
    },
}

/// How a loop that ended without error finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSummary {
    pub pid: u32,
    pub state: WatchState,
    pub samples_written: u64,
}

enum TickError {
    Sample(SampleError),
    Store(StoreError),
}

/// Samples one pid on a fixed cadence and appends each snapshot to a [`Store`].
pub struct WatchLoop<F: FileSystem + 'static> {
    pid: u32,
    sampler: Arc<Sampler<F>>,
    store: Arc<Store>,
    interval: Duration,
    cancel: CancellationToken,
    state_tx: watch::Sender<WatchState>,
}

impl<F: FileSystem + 'static> WatchLoop<F> {
    pub fn new(pid: u32, sampler: Arc<Sampler<F>>, store: Arc<Store>) -> Self {
        let (state_tx, _) = watch::channel(WatchState::Running);
        Self {
            pid,
            sampler,
            store,
            interval: DEFAULT_INTERVAL,
            cancel: CancellationToken::new(),
            state_tx,
        }
    }

    /// Sets the delay between the end of one tick and the start of the next.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Stops the loop when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<WatchState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> WatchState {
        *self.state_tx.borrow()
    }

    /// Runs until the process exits, the token is cancelled, or a tick fails.
    pub async fn run(self) -> Result<WatchSummary, WatchError> {
        let pid = self.pid;
        info!(
            pid,
            interval_ms = self.interval.as_millis() as u64,
            "watch started"
        );

        let mut samples_written: u64 = 0;
        let mut prev: Option<Snapshot> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.finish(WatchState::Stopped, samples_written));
            }

            let t0 = Instant::now();
            match self.tick().await {
                Ok(Ok(snapshot)) => {
                    if let Some(counter) = prev
                        .as_ref()
                        .and_then(|prev| snapshot.first_counter_regression(prev))
                    {
                        warn!(
                            pid,
                            counter,
                            "cumulative counter decreased, pid may have been reused"
                        );
                    }
                    samples_written += 1;
                    debug!(
                        pid,
                        samples_written,
                        duration_us = t0.elapsed().as_micros() as u64,
                        "tick completed"
                    );
                    prev = Some(snapshot);
                }
                Ok(Err(TickError::Sample(e))) if e.is_process_gone() => {
                    return Ok(self.finish(WatchState::Terminated, samples_written));
                }
                Ok(Err(TickError::Sample(source))) => {
                    return Err(self.fail(WatchError::SampleFailure { pid, source }));
                }
                Ok(Err(TickError::Store(source))) => {
                    return Err(self.fail(WatchError::StoreWriteFailure { pid, source }));
                }
                Err(source) => {
                    return Err(self.fail(WatchError::Task { pid, source }));
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Ok(self.finish(WatchState::Stopped, samples_written));
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// One sample and one insert, on the blocking pool.
    async fn tick(&self) -> Result<Result<Snapshot, TickError>, JoinError> {
        let pid = self.pid;
        let sampler = Arc::clone(&self.sampler);
        let store = Arc::clone(&self.store);

        tokio::task::spawn_blocking(move || {
            let snapshot = sampler.sample(pid).map_err(TickError::Sample)?;
            store.insert(snapshot.clone()).map_err(TickError::Store)?;
            Ok(snapshot)
        })
        .await
    }

    fn finish(&self, state: WatchState, samples_written: u64) -> WatchSummary {
        match state {
            WatchState::Terminated => {
                info!(pid = self.pid, samples_written, "process exited, watch terminated")
            }
            _ => info!(pid = self.pid, samples_written, state = ?state, "watch finished"),
        }
        self.state_tx.send_replace(state);
        WatchSummary {
            pid: self.pid,
            state,
            samples_written,
        }
    }

    fn fail(&self, err: WatchError) -> WatchError {
        error!(pid = self.pid, error = %err, "watch failed");
        self.state_tx.send_replace(WatchState::Failed);
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MockFs;
    use tempfile::tempdir;

    const PID: u32 = 4242;
    const TICK: Duration = Duration::from_millis(5);

    fn watch_loop(fs: &MockFs, store: &Arc<Store>) -> WatchLoop<MockFs> {
        let sampler = Arc::new(Sampler::new(fs.clone(), "/proc"));
        WatchLoop::new(PID, sampler, Arc::clone(store)).with_interval(TICK)
    }

    async fn wait_for_count(store: &Store, n: usize) {
        for _ in 0..400 {
            if store.count(PID).unwrap() >= n {
                return;
            }
            tokio::time::sleep(TICK).await;
        }
        panic!("store never reached {n} samples");
    }

    #[tokio::test]
    async fn test_terminates_when_process_exits() {
        let fs = MockFs::single_process();
        let store = Arc::new(Store::in_memory());
        let watch = watch_loop(&fs, &store);
        let mut state = watch.subscribe();

        let handle = tokio::spawn(watch.run());
        wait_for_count(&store, 2).await;
        fs.remove_process(PID);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.state, WatchState::Terminated);
        assert_eq!(*state.borrow_and_update(), WatchState::Terminated);

        let written = store.count(PID).unwrap();
        assert_eq!(summary.samples_written, written as u64);

        tokio::time::sleep(TICK * 6).await;
        assert_eq!(store.count(PID).unwrap(), written);
    }

    #[tokio::test]
    async fn test_missing_process_terminates_immediately() {
        let fs = MockFs::new();
        let store = Arc::new(Store::in_memory());

        let summary = watch_loop(&fs, &store).run().await.unwrap();
        assert_eq!(summary.state, WatchState::Terminated);
        assert_eq!(summary.samples_written, 0);
        assert_eq!(store.count(PID).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_loop() {
        let fs = MockFs::single_process();
        let store = Arc::new(Store::in_memory());
        let token = CancellationToken::new();
        let watch = watch_loop(&fs, &store).with_cancellation(token.clone());
        assert_eq!(watch.state(), WatchState::Running);

        let handle = tokio::spawn(watch.run());
        wait_for_count(&store, 1).await;
        token.cancel();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.state, WatchState::Stopped);
        assert!(summary.samples_written >= 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_writes_nothing() {
        let fs = MockFs::single_process();
        let store = Arc::new(Store::in_memory());
        let watch = watch_loop(&fs, &store);
        watch.cancellation_token().cancel();

        let summary = watch.run().await.unwrap();
        assert_eq!(summary.state, WatchState::Stopped);
        assert_eq!(store.count(PID).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_parse_failure_fails_loop() {
        let fs = MockFs::single_process();
        fs.add_file("/proc/4242/stat", "4242 (worker) S");
        let store = Arc::new(Store::in_memory());
        let watch = watch_loop(&fs, &store);
        let state = watch.subscribe();

        let err = watch.run().await.unwrap_err();
        assert!(matches!(err, WatchError::SampleFailure { pid: PID, .. }));
        assert_eq!(*state.borrow(), WatchState::Failed);
        assert_eq!(store.count(PID).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_fails_loop() {
        let fs = MockFs::single_process();
        fs.deny("/proc/4242/io");
        let store = Arc::new(Store::in_memory());

        let err = watch_loop(&fs, &store).run().await.unwrap_err();
        assert!(matches!(
            err,
            WatchError::SampleFailure {
                source: SampleError::Io { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_closed_store_fails_loop() {
        let fs = MockFs::single_process();
        let store = Arc::new(Store::in_memory());
        store.close().unwrap();

        let err = watch_loop(&fs, &store).run().await.unwrap_err();
        assert!(matches!(
            err,
            WatchError::StoreWriteFailure {
                source: StoreError::Closed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_samples_survive_reopen() {
        let dir = tempdir().unwrap();
        let fs = MockFs::single_process();
        let store = Arc::new(Store::open(dir.path()).unwrap());

        let handle = tokio::spawn(watch_loop(&fs, &store).run());
        wait_for_count(&store, 3).await;
        fs.remove_process(PID);
        let summary = handle.await.unwrap().unwrap();
        store.close().unwrap();

        let reopened = Store::open(dir.path()).unwrap();
        assert_eq!(reopened.count(PID).unwrap() as u64, summary.samples_written);
        assert_eq!(reopened.latest(PID).unwrap().unwrap().name, "worker");
    }

    #[test]
    fn test_state_is_finished() {
        assert!(!WatchState::Running.is_finished());
        assert!(WatchState::Terminated.is_finished());
        assert!(WatchState::Stopped.is_finished());
        assert!(WatchState::Failed.is_finished());
    }
}
