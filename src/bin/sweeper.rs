//! Conquest Sweeper - drains pending conquest jobs
//!
//! Runs against the same database as the server. With no interval it runs a
//! single tick and exits (for cron-style schedulers).
//!
//! Usage:
//!   conquest-sweeper --db-path ./data/conquest.db
//!   conquest-sweeper --interval-secs 60

use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use conquest::config::{CoreArgs, LimitsConfig};
use conquest::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "conquest-sweeper")]
#[command(about = "Process pending conquest jobs")]
#[command(version)]
struct Args {
    #[command(flatten)]
    core: CoreArgs,

    /// Loop forever with this many seconds between ticks
    #[arg(long, env = "SWEEP_INTERVAL_SECS")]
    interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.core.default_log_filter())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.core.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let pipeline = Pipeline::from_config(&args.core, LimitsConfig::default(), args.core.sweeper())?;
    let sweeper = pipeline.sweeper();

    match args.interval_secs.filter(|secs| *secs > 0) {
        None => {
            let report = sweeper.tick().await?;
            info!(
                examined = report.examined,
                completed = report.completed,
                failed = report.failed,
                "Single sweep done"
            );
        }
        Some(secs) => {
            info!("Sweeping every {}s", secs);
            let handle = sweeper.spawn(Duration::from_secs(secs));
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
            handle.abort();
        }
    }

    Ok(())
}
