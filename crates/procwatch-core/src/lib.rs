//! procwatch-core: sampling and delta-rate engine for a single watched process.
//!
//! Provides:
//! - `collector`: `/proc/[pid]` parsers, the `Sampler`, and the filesystem seam
//! - `storage`: the `Snapshot` model and the append-only `Store`
//! - `watch`: the per-pid sampling loop
//! - `query`: range queries that turn cumulative counters into rates
//! - `config`: defaults and validation for the above

pub mod collector;
pub mod config;
pub mod query;
pub mod storage;
pub mod watch;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
