//! Sample model and the append-only store.

pub mod model;
pub mod store;

pub use model::{COUNTER_NAMES, Snapshot};
pub use store::{Store, StoreError, WAL_FILE_NAME};
