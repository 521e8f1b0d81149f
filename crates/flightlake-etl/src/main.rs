//! flightlake-etl binary entry point

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flightlake::{
    run_server, CheckpointManager, EngineConfig, EngineError, FileCatalog, Orchestrator,
    RunOutcome, ServerState, ShutdownSignal, StopReason, TcpLineSource,
};

/// Run duration used by `--demo` when none is given
const DEMO_RUN_DURATION: &str = "10s";

#[derive(Parser, Debug)]
#[command(name = "flightlake-etl")]
#[command(about = "Micro-batch streaming ETL for flight records")]
struct Args {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source host
    #[arg(long, env = "FLIGHTLAKE_HOST")]
    host: Option<String>,

    /// Source port
    #[arg(short, long, env = "FLIGHTLAKE_PORT")]
    port: Option<u16>,

    /// Stop after this long, e.g. "30s" or "5m"
    #[arg(long)]
    run_duration: Option<String>,

    /// Short bounded run for demonstrations
    #[arg(long)]
    demo: bool,

    /// Clear checkpoint and catalog state before starting
    #[arg(long)]
    fresh: bool,

    /// Serve /health, /ready and /metrics on this address
    #[arg(long, env = "FLIGHTLAKE_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(outcome) => {
            info!(
                reason = %outcome.reason,
                batches = outcome.batches_committed,
                last_committed_batch = ?outcome.last_committed_batch,
                discarded_lines = outcome.lines_discarded,
                "==== flightlake-etl stopped ===="
            );
            if outcome.reason.is_graceful() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "flightlake-etl failed");
            ExitCode::FAILURE
        }
    }
}

/// Merge the optional config file with command-line overrides
fn launch_config(args: &Args) -> Result<EngineConfig, EngineError> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path).map_err(|e| {
            error!(error = %e, path = ?path, "Failed to load config");
            e
        })?,
        None => EngineConfig::default(),
    };

    if let Some(host) = &args.host {
        config.source_host = host.clone();
    }
    if let Some(port) = args.port {
        config.source_port = port;
    }
    match &args.run_duration {
        Some(d) => config.run_duration = Some(d.clone()),
        None if args.demo && config.run_duration.is_none() => {
            config.run_duration = Some(DEMO_RUN_DURATION.to_string());
        }
        None => {}
    }

    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> Result<RunOutcome, EngineError> {
    let launch = launch_config(&args)?;
    // Run duration is a property of this process, not of the pipeline
    let run_duration = launch.run_duration()?;

    if args.fresh {
        CheckpointManager::reset(&launch.checkpoint_dir)?;
        FileCatalog::open(&launch.catalog_path)?.clear().await?;
        info!("Fresh start requested, previous state cleared");
    }

    let checkpoint = CheckpointManager::open(&launch.checkpoint_dir, launch.clone())?;
    let config = checkpoint.config().clone();

    info!(
        source = %config.source_addr(),
        interval = %config.batch_interval,
        table = %config.table_name,
        output = ?config.output_dir,
        checkpoint = ?config.checkpoint_dir,
        state = %checkpoint.state(),
        "Starting flightlake-etl"
    );

    let catalog = Arc::new(FileCatalog::open(&config.catalog_path)?);
    info!(path = ?catalog.path(), "Catalog opened");
    let source = TcpLineSource::new(config.source_addr());
    let shutdown = ShutdownSignal::new();

    let mut orchestrator =
        Orchestrator::new(source, catalog, checkpoint, shutdown.clone())?.with_run_duration(run_duration);

    if let Some(addr) = args.metrics_addr {
        let state = ServerState::new(&config.table_name, orchestrator.status());
        let cancel = shutdown.token();
        info!(addr = %addr, "Starting health server");
        tokio::spawn(async move {
            if let Err(e) = run_server(addr, state, cancel).await {
                error!(error = %e, "Health server error");
            }
        });
    }

    tokio::spawn(forward_signals(shutdown));

    orchestrator.run().await
}

/// Turn SIGTERM/SIGINT into a shutdown request
async fn forward_signals(shutdown: ShutdownSignal) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to create SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to create SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down gracefully"),
        _ = sigint.recv() => info!("SIGINT received, shutting down gracefully"),
        _ = shutdown.requested() => return,
    }
    shutdown.request(StopReason::Signal);
}
