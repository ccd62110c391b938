//! Shared application state.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;

use tokio::sync::watch;

use procwatch_core::query::QueryEngine;
use procwatch_core::storage::Store;
use procwatch_core::watch::WatchState;

/// In-process watch of a single pid, if the server was started with one.
#[derive(Clone)]
pub(crate) struct WatchHandle {
    pub(crate) pid: u32,
    pub(crate) state: watch::Receiver<WatchState>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Arc<Store>,
    pub(crate) engine: Arc<QueryEngine>,
    pub(crate) watch: Option<WatchHandle>,
}

impl AppState {
    pub(crate) fn new(store: Arc<Store>, engine: QueryEngine) -> Self {
        Self {
            store,
            engine: Arc::new(engine),
            watch: None,
        }
    }

    pub(crate) fn with_watch(mut self, pid: u32, state: watch::Receiver<WatchState>) -> Self {
        self.watch = Some(WatchHandle { pid, state });
        self
    }
}
