mod handlers;
mod openapi;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use procwatch_core::collector::{RealFs, Sampler};
use procwatch_core::config::{ConfigError, QueryConfig, WatchConfig};
use procwatch_core::query::QueryEngine;
use procwatch_core::storage::Store;
use procwatch_core::watch::WatchLoop;

use state::AppState;

// ============================================================
// CLI
// ============================================================

#[derive(Parser, Debug)]
#[command(name = "procwatch-web", about = "procwatch query API server", version = procwatch_core::VERSION)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:3000", env = "PROCWATCH_LISTEN")]
    listen: String,

    /// Directory holding the sample log.
    #[arg(long, default_value = "./data", env = "PROCWATCH_DATA")]
    data_dir: PathBuf,

    /// Watch this pid in-process while serving queries.
    /// Do not point a running procwatchd at the same data directory.
    #[arg(long, env = "PROCWATCH_PID")]
    pid: Option<u32>,

    /// Sampling interval in seconds (with --pid).
    #[arg(long, default_value = "1", env = "PROCWATCH_INTERVAL")]
    interval: u64,

    /// Path to /proc filesystem (with --pid).
    #[arg(long, default_value = "/proc")]
    proc_path: PathBuf,

    /// Kernel clock ticks per second (USER_HZ) used to convert CPU times.
    #[arg(long, default_value = "100")]
    clock_tick_rate: u64,

    /// History fetched before a query's start to seed its first rate, in seconds.
    #[arg(long, default_value = "360")]
    lookback: i64,

    /// Range served when a query omits start_ts, in seconds.
    #[arg(long, default_value = "300")]
    window: i64,
}

impl Args {
    fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            interval: Duration::from_secs(self.interval),
            clock_tick_rate: self.clock_tick_rate,
            proc_path: self.proc_path.clone(),
        }
    }

    fn query_config(&self) -> Result<QueryConfig, ConfigError> {
        QueryConfig::from_secs(self.lookback, self.window)
    }
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "procwatch_web=info,procwatch_core=info".into()),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };

    if let Err(msg) = runtime.block_on(async_main(args)) {
        error!("{msg}");
        process::exit(1);
    }
}

async fn async_main(args: Args) -> Result<(), String> {
    let watch_config = args.watch_config();
    let query_config = watch_config
        .validate()
        .and_then(|()| args.query_config())
        .and_then(|query_config| query_config.validate().map(|()| query_config))
        .map_err(|e| format!("invalid configuration: {e}"))?;

    info!(version = procwatch_core::VERSION, path = %args.data_dir.display(), "starting");
    let store = Arc::new(
        Store::open(&args.data_dir)
            .map_err(|e| format!("failed to open store at {}: {e}", args.data_dir.display()))?,
    );

    let engine = QueryEngine::new(Arc::clone(&store), query_config);
    let mut state = AppState::new(Arc::clone(&store), engine);

    let shutdown = CancellationToken::new();
    let mut watch_task = None;

    if let Some(pid) = args.pid {
        let sampler = Sampler::new(RealFs::new(), &watch_config.proc_path)
            .with_clock_tick_rate(watch_config.clock_tick_rate);
        let watch = WatchLoop::new(pid, Arc::new(sampler), Arc::clone(&store))
            .with_interval(watch_config.interval)
            .with_cancellation(shutdown.child_token());
        state = state.with_watch(pid, watch.subscribe());
        info!(pid, interval_s = args.interval, "watching process");
        // The server keeps serving after the watch ends.
        watch_task = Some(tokio::spawn(watch.run()));
    }

    let app = handlers::router(state);

    let addr: SocketAddr = args
        .listen
        .parse()
        .map_err(|e| format!("invalid listen address {}: {e}", args.listen))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;
    info!(%addr, "listening");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("received shutdown signal");
        signal.cancel();
    });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    shutdown.cancel();
    if let Some(task) = watch_task {
        match task.await {
            Ok(Ok(summary)) => info!(
                pid = summary.pid,
                samples = summary.samples_written,
                state = ?summary.state,
                "watch ended"
            ),
            Ok(Err(e)) => error!(error = %e, "watch failed"),
            Err(e) => error!(error = %e, "watch task panicked"),
        }
    }

    store
        .close()
        .map_err(|e| format!("failed to close store: {e}"))?;
    info!("shutdown complete");

    served.map_err(|e| format!("server error: {e}"))
}
