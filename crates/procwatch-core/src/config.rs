//! Configuration for the watch loop and the query engine.
//!
//! Binaries build these from their CLI arguments and call `validate` before
//! starting anything.

use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use thiserror::Error;

use crate::collector::DEFAULT_CLOCK_TICK_RATE;

/// Delay between the end of one tick and the start of the next.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
/// History fetched before a query's start to seed the first delta.
pub const DEFAULT_LOOKBACK_SECS: i64 = 6 * 60;
/// Range used when a query omits its start.
pub const DEFAULT_WINDOW_SECS: i64 = 5 * 60;
pub const DEFAULT_PROC_PATH: &str = "/proc";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("sampling interval must be greater than zero")]
    ZeroInterval,
    #[error("clock tick rate must be between 1 and 1000000 Hz, got {0}")]
    ClockTickRate(u64),
    #[error("lookback must not be negative")]
    NegativeLookback,
    #[error("default query window must be positive")]
    NonPositiveWindow,
    #[error("{name} of {secs} seconds is out of range")]
    DurationOutOfRange { name: &'static str, secs: i64 },
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub interval: Duration,
    /// USER_HZ used to convert CPU ticks; not queried from the OS.
    pub clock_tick_rate: u64,
    pub proc_path: PathBuf,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            clock_tick_rate: DEFAULT_CLOCK_TICK_RATE,
            proc_path: PathBuf::from(DEFAULT_PROC_PATH),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if !(1..=1_000_000).contains(&self.clock_tick_rate) {
            return Err(ConfigError::ClockTickRate(self.clock_tick_rate));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryConfig {
    pub lookback: TimeDelta,
    pub default_window: TimeDelta,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            lookback: TimeDelta::seconds(DEFAULT_LOOKBACK_SECS),
            default_window: TimeDelta::seconds(DEFAULT_WINDOW_SECS),
        }
    }
}

impl QueryConfig {
    /// Builds a config from whole seconds, as given on the command line.
    pub fn from_secs(lookback: i64, default_window: i64) -> Result<Self, ConfigError> {
        let delta = |name, secs| {
            TimeDelta::try_seconds(secs).ok_or(ConfigError::DurationOutOfRange { name, secs })
        };
        Ok(Self {
            lookback: delta("lookback", lookback)?,
            default_window: delta("window", default_window)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookback < TimeDelta::zero() {
            return Err(ConfigError::NegativeLookback);
        }
        if self.default_window <= TimeDelta::zero() {
            return Err(ConfigError::NonPositiveWindow);
        }
        Ok(())
    }
}
