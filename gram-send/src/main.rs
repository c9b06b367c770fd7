//! gram-send - Background daemon for the publish queue
//!
//! Fires due durable jobs, runs periodic recovery sweeps and shuts down
//! cleanly on SIGINT/SIGTERM.

use anyhow::Context;
use clap::Parser;
use libgramcast::logging::LoggingConfig;
use libgramcast::publishing::create_publisher;
use libgramcast::{Collaborators, Config, Database, GramcastError, GramcastService, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "gram-send")]
#[command(version)]
#[command(about = "Background daemon for the Gramcast publish queue")]
#[command(long_about = "\
gram-send - Background daemon for the Gramcast publish queue

DESCRIPTION:
    gram-send is a long-running daemon that fires the durable jobs created by
    gram-queue: queued items are published once the per-account rate limit
    allows, scheduled posts at their time. Failed attempts are retried after
    the configured delay until the retry budget runs out.

    On start it re-arms jobs a previous run claimed but never finished, and
    every sweep interval it re-dispatches due work whose job was lost.

USAGE:
    # Run in foreground (logs to stderr)
    gram-send

    # Poll every second
    gram-send --poll-interval 1

    # Enable verbose logging
    gram-send --verbose

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current batch)

CONFIGURATION:
    Configuration file: ~/.config/gramcast/config.toml
    Database location: ~/.local/share/gramcast/gramcast.db

    [daemon]
    poll_interval_secs = 5    # seconds between job polls
    sweep_interval_secs = 60  # seconds between recovery sweeps

    [publisher]
    kind = \"command\"
    command = \"/usr/local/bin/publish-media\"

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or database error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Sweep interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    sweep_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Fire due jobs and sweep once, print the report and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env("info", cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "gram-send stopped");
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<GramcastError>()
            .map(GramcastError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(secs) = cli.poll_interval {
        config.daemon.poll_interval_secs = secs;
    }
    if let Some(secs) = cli.sweep_interval {
        config.daemon.sweep_interval_secs = secs;
    }
    config.validate()?;

    let db = Arc::new(
        Database::new(&config.database.path)
            .await
            .with_context(|| format!("opening database {}", config.database.path))?,
    );
    let publisher = create_publisher(&config.publisher)?;
    info!(publisher = publisher.name(), "gram-send starting");

    let service = GramcastService::new(
        &config,
        Collaborators::sqlite(db, publisher, Arc::new(SystemClock)),
    );

    let recovered = service.recover_interrupted().await?;
    if recovered > 0 {
        info!(count = recovered, "Re-armed jobs interrupted by a previous run");
    }

    if cli.once {
        let mut report = service.run_due_jobs().await?;
        report.merge(service.sweep().await?);
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    run_daemon_loop(&service, &config).await?;
    info!("gram-send stopped");
    Ok(())
}

async fn run_daemon_loop(service: &GramcastService, config: &Config) -> anyhow::Result<()> {
    info!(
        poll_interval_secs = config.daemon.poll_interval_secs,
        sweep_interval_secs = config.daemon.sweep_interval_secs,
        "Entering daemon loop"
    );

    let mut poll = interval(Duration::from_secs(config.daemon.poll_interval_secs));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep = interval(Duration::from_secs(config.daemon.sweep_interval_secs));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                info!("Shutdown requested, stopping daemon loop");
                break;
            }
            _ = poll.tick() => {
                match service.run_due_jobs().await {
                    Ok(report) if report.total() > 0 => info!(?report, "Fired due jobs"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Error firing due jobs"),
                }
            }
            _ = sweep.tick() => {
                match service.sweep().await {
                    Ok(report) if report.total() > 0 => info!(?report, "Sweep re-dispatched work"),
                    Ok(_) => debug!("Sweep found nothing due"),
                    Err(e) => error!(error = %e, "Error during sweep"),
                }
            }
        }
    }

    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM
#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use futures::stream::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("installing signal handlers")?;
    let handle = signals.handle();
    if let Some(signal) = signals.next().await {
        info!(signal, "Received shutdown signal, stopping gracefully");
    }
    handle.close();
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("Received Ctrl-C, stopping gracefully");
    Ok(())
}
