//! procwatchd - single-process metrics sampler.
//!
//! Samples `/proc/[pid]/{status,io,stat}` of one process on a fixed interval
//! and appends every sample to the write-ahead log in the output directory.
//! Exits when the process does, on SIGINT/SIGTERM, or on the first error.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use procwatch_core::collector::{RealFs, Sampler};
use procwatch_core::config::WatchConfig;
use procwatch_core::storage::Store;
use procwatch_core::watch::{WatchLoop, WatchState};

/// Single-process metrics sampler.
#[derive(Parser, Debug)]
#[command(name = "procwatchd", about = "Single-process metrics sampler", version = procwatch_core::VERSION)]
struct Args {
    /// Process id to watch.
    pid: u32,

    /// Sampling interval in seconds.
    #[arg(short, long, default_value = "1")]
    interval: u64,

    /// Directory holding the sample log.
    #[arg(short, long, default_value = "./data")]
    output_dir: PathBuf,

    /// Path to /proc filesystem (for testing/mocking).
    #[arg(long, default_value = "/proc")]
    proc_path: PathBuf,

    /// Kernel clock ticks per second (USER_HZ) used to convert CPU times.
    #[arg(long, default_value = "100")]
    clock_tick_rate: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            interval: Duration::from_secs(self.interval),
            clock_tick_rate: self.clock_tick_rate,
            proc_path: self.proc_path.clone(),
        }
    }
}

/// Formats bytes as human-readable size string.
fn format_size(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;
    const KB: u64 = 1024;

    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["procwatchd", "procwatch_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build tokio runtime: {}", e);
            process::exit(1);
        }
    };

    process::exit(runtime.block_on(run(args)));
}

async fn run(args: Args) -> i32 {
    let config = args.watch_config();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return 2;
    }

    info!("procwatchd {} starting", procwatch_core::VERSION);
    info!(
        "Config: pid={}, interval={}s, output={}, proc={}, clock_tick_rate={}",
        args.pid,
        args.interval,
        args.output_dir.display(),
        config.proc_path.display(),
        config.clock_tick_rate
    );

    let store = match Store::open(&args.output_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open store at {}: {}", args.output_dir.display(), e);
            return 1;
        }
    };
    if let Some(len) = store.wal_len() {
        info!("Storage initialized at {} ({})", args.output_dir.display(), format_size(len));
    }

    let sampler = Sampler::new(RealFs::new(), &config.proc_path)
        .with_clock_tick_rate(config.clock_tick_rate);
    if !sampler.is_alive(args.pid) {
        warn!("Process {} not found under {}", args.pid, config.proc_path.display());
    }

    // Setup graceful shutdown
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        token.cancel();
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let watch = WatchLoop::new(args.pid, Arc::new(sampler), Arc::clone(&store))
        .with_interval(config.interval)
        .with_cancellation(shutdown);

    let code = match watch.run().await {
        Ok(summary) => {
            match summary.state {
                WatchState::Terminated => info!(
                    "Process {} exited after {} samples",
                    summary.pid, summary.samples_written
                ),
                _ => info!(
                    "Stopped watching {} after {} samples",
                    summary.pid, summary.samples_written
                ),
            }
            0
        }
        Err(e) => {
            error!("Watch failed: {}", e);
            1
        }
    };

    info!("Shutting down...");
    let bytes = store.wal_len().unwrap_or(0);
    if let Err(e) = store.close() {
        error!("Failed to close store: {}", e);
        return 1;
    }
    info!("Shutdown complete ({} on disk)", format_size(bytes));

    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(2048), "2.0K");
        assert_eq!(format_size(5 * 1024 * 1024 + 512 * 1024), "5.5M");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0G");
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["procwatchd", "4242"]).unwrap();
        assert_eq!(args.pid, 4242);
        assert_eq!(args.output_dir, PathBuf::from("./data"));

        let config = args.watch_config();
        assert_eq!(config.interval, Duration::from_secs(1));
        assert_eq!(config.clock_tick_rate, 100);
        assert_eq!(config.proc_path, PathBuf::from("/proc"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_args_zero_interval_is_invalid() {
        let args = Args::try_parse_from(["procwatchd", "1", "--interval", "0"]).unwrap();
        assert!(args.watch_config().validate().is_err());
    }

    #[test]
    fn test_args_require_pid() {
        assert!(Args::try_parse_from(["procwatchd"]).is_err());
    }
}
