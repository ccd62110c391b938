//! Mock filesystem for testing.
//!
//! This module provides `MockFs` and pre-built scenarios for testing the
//! sampler without requiring a Linux `/proc` filesystem.

mod filesystem;
mod scenarios;

pub use filesystem::MockFs;
pub use scenarios::{IO_BLOCK, stat_line, status_block};
