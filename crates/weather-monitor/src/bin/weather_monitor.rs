//! Weather monitor host process.
//!
//! Usage:
//!   weather-monitor -c config.yaml        # tick until Ctrl+C
//!   weather-monitor -c config.yaml --once # single cycle, then exit

use anyhow::Context;
use argh::FromArgs;
use std::sync::Arc;
use tokio::sync::watch;
use weather_monitor::prelude::*;
use weather_monitor::{setup_logging, SchedulerState};

#[derive(FromArgs)]
/// Poll weather for configured locations, raise alerts and persist the latest observation
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c', default = "String::from(\"config.yaml\")")]
    config: String,

    /// run a single fetch cycle and exit
    #[argh(switch)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();

    let args: Args = argh::from_env();

    let config = MonitorConfig::from_file(&args.config)
        .with_context(|| format!("loading config from '{}'", args.config))?;
    let scheduler_config = config.scheduler_config()?;

    for location in scheduler_config.locations.iter() {
        log::info!("Monitoring {} ({})", location.name, location.id);
    }

    let store = SqliteStore::open(&config.store.path)
        .with_context(|| format!("opening store at {}", config.store.path.display()))?;
    let provider = OpenMeteoProvider::new(&config.provider.base_url);

    // Shutdown channel, fired by Ctrl+C or a scheduler failure. The payload
    // holds the failure reason, if any.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(None::<String>);
    let failure_tx = shutdown_tx.clone();

    let scheduler = MonitorScheduler::new(
        scheduler_config,
        Arc::new(provider),
        Arc::new(store),
        Arc::new(LogAlertSink),
    )?
    .with_evaluator(AlertEvaluator::new(config.alerts.clone()))
    .on_failure(move |failure| {
        log::error!("Scheduler failed: {}", failure.reason);
        failure_tx.send_replace(Some(failure.reason));
    });

    if args.once {
        scheduler.run_once().await?;
        let stats = scheduler.stats();
        log::info!(
            "Cycle complete: {} persisted, {} alerts, {} provider failures, {} store failures",
            stats.upserts,
            stats.alerts,
            stats.provider_failures,
            stats.store_failures
        );
        let failure = shutdown_rx.borrow().clone();
        return exit_status(failure);
    }

    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, shutting down gracefully...");
        shutdown_tx.send_modify(|_| {});
    })
    .context("setting Ctrl+C handler")?;

    scheduler.start()?;
    log::info!("Weather monitor running. Press Ctrl+C to stop.");

    let _ = shutdown_rx.changed().await;

    if scheduler.state() == SchedulerState::Running {
        scheduler.stop().await?;
    }

    let stats = scheduler.stats();
    log::info!(
        "Weather monitor shut down after {} ticks ({} persisted, {} alerts)",
        stats.ticks,
        stats.upserts,
        stats.alerts
    );
    let failure = shutdown_rx.borrow().clone();
    exit_status(failure)
}

/// Non-zero exit when the scheduler died on a fatal failure.
fn exit_status(failure: Option<String>) -> anyhow::Result<()> {
    match failure {
        Some(reason) => anyhow::bail!("scheduler failed: {}", reason),
        None => Ok(()),
    }
}
