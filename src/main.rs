//! # Pub/Sub Benchmark - Main Entry Point
//!
//! Measures request/reply latency or throughput of a publish/subscribe
//! transport across a sweep of payload sizes.
//!
//! ## Lifecycle
//!
//! 1. **Parse arguments** and install logging
//! 2. **Freeze configuration** into a `RunConfig`
//! 3. **Watch for SIGINT/SIGTERM**, which raise the shared stop token
//! 4. **Run the controller** on a blocking thread; the sweep itself is
//!    synchronous and waits on condition variables, not on the async runtime
//!
//! An interrupted run still reports every size class that finished.

use anyhow::{Context, Result};
use clap::Parser;
use pubsub_bench::{cli::Args, logging, RunConfig, RunController, StopToken};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Held until exit so buffered file logs are flushed
    let _log_guard = logging::init(args.verbose, args.log_file.as_deref())?;

    let config = RunConfig::from_args(&args).context("invalid configuration")?;
    info!(
        "Pub/Sub Benchmark {}: {} test, role {}, transport {}",
        pubsub_bench::VERSION,
        config.mode,
        config.role,
        config.transport
    );

    let stop = StopToken::new();
    tokio::spawn(watch_signals(stop.clone()));

    let controller = RunController::new(config, stop);
    let result = tokio::task::spawn_blocking(move || controller.run())
        .await
        .context("benchmark thread failed")?;

    match result {
        Ok(rows) => {
            info!("Benchmark finished with {} report rows", rows.len());
            Ok(())
        }
        Err(e) => {
            error!("Benchmark failed: {:#}", e);
            Err(e)
        }
    }
}

/// Raise `stop` on the first SIGINT or SIGTERM
async fn watch_signals(stop: StopToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Interrupt received, stopping");
    stop.stop();
}
