//! Per-process metrics collection from the Linux `/proc` filesystem.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                    Sampler                    │
//! │  /proc/[pid]/status  /proc/[pid]/io  .../stat │
//! │              └──────────┬──────────┘          │
//! │                  ┌──────▼──────┐              │
//! │                  │  FileSystem │ (trait)      │
//! │                  └──────┬──────┘              │
//! └─────────────────────────┼─────────────────────┘
//!                  ┌────────┴────────┐
//!           ┌──────▼──────┐   ┌──────▼──────┐
//!           │   RealFs    │   │   MockFs    │
//!           │  (Linux)    │   │  (Testing)  │
//!           └─────────────┘   └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use procwatch_core::collector::{MockFs, Sampler};
//!
//! let fs = MockFs::single_process();
//! let sampler = Sampler::new(fs, "/proc");
//! let snapshot = sampler.sample(4242).unwrap();
//! assert_eq!(snapshot.name, "worker");
//! ```

pub mod mock;
pub mod procfs;
pub mod traits;

pub use mock::MockFs;
pub use procfs::{DEFAULT_CLOCK_TICK_RATE, ParseError, SampleError, Sampler};
pub use traits::{FileSystem, RealFs};
