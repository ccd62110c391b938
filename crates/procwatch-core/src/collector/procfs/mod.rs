//! Readers for the per-process accounting files under `/proc/[pid]/`.

pub mod parser;
pub mod sampler;

pub use parser::ParseError;
pub use sampler::{DEFAULT_CLOCK_TICK_RATE, SampleError, Sampler};
