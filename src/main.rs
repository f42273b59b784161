mod clock;
mod config;
mod connection;
mod process;
mod retry;
mod telemetry;
mod watcher;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use clock::TokioClock;
use config::TetherConfig;
use connection::{WorkerConnection, WorkerConnector};
use process::{WorkerLauncher, WorkerSpec};
use telemetry::LogSink;
use watcher::{ConnectionWatcher, Observer, StartOutcome};

/// Supervises a single worker process connection, restarting the worker
/// on loss with a bounded number of consecutive launch retries.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
struct Cli {
    /// Worker command to supervise (overrides config)
    command: Option<String>,

    /// Arguments for the worker command, after `--`
    #[arg(last = true)]
    args: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "tether.toml")]
    config: PathBuf,

    /// Max consecutive failed launches per sequence (overrides config)
    #[arg(long)]
    retries: Option<u32>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (launch attempts, backoff decisions, telemetry)
    #[arg(short, long)]
    verbose: bool,
}

/// Merge CLI overrides into the loaded config.
fn resolve(cli: &Cli, mut config: TetherConfig) -> TetherConfig {
    if let Some(command) = &cli.command {
        config.worker.command = command.clone();
        config.worker.args = cli.args.clone();
    }
    if let Some(retries) = cli.retries {
        config.watcher.max_launch_attempts = retries;
    }
    config
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let config = match config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };
    let config = resolve(&cli, config);

    if config.worker.command.is_empty() {
        eprintln!(
            "no worker command: set [worker] command in {} or pass one on the command line",
            cli.config.display()
        );
        std::process::exit(2);
    }

    if cli.dry_run {
        println!(
            "worker command: {} {}",
            config.worker.command,
            config.worker.args.join(" ")
        );
        println!(
            "max launch attempts: {}",
            config.watcher.max_launch_attempts
        );
        println!(
            "backoff: {}ms initial, {}ms cap",
            config.watcher.initial_backoff_ms, config.watcher.max_backoff_ms
        );
        return;
    }

    let launcher = WorkerLauncher::new(WorkerSpec {
        command: config.worker.command.clone(),
        args: config.worker.args.clone(),
    });

    let observer: Observer<WorkerConnection> = Box::new(|conn| {
        match conn {
            Some(conn) => tracing::info!(pid = conn.pid(), "worker available"),
            None => tracing::warn!("worker unavailable, reconnecting"),
        }
        Ok(())
    });

    let watcher = ConnectionWatcher::new(
        launcher,
        WorkerConnector,
        observer,
        Arc::new(TokioClock),
        config.watcher.retry_settings(),
    )
    .with_telemetry(Arc::new(LogSink));

    match watcher.start().await {
        Ok(StartOutcome::Connected) => {}
        Ok(StartOutcome::GaveUp) => {
            std::process::exit(1);
        }
        Err(err) => {
            tracing::error!(error = %err, "watcher failed to start");
            std::process::exit(1);
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to wait for shutdown signal");
    }
    tracing::info!("shutting down");
    watcher.dispose();
}
