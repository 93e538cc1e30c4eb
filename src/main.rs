//! Conquest server
//!
//! Opens the database, seeds the grid, and serves the HTTP API alongside the
//! periodic sweeper and rate limiter housekeeping.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use conquest::{config::Args, http::HttpServer, Pipeline};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.core.default_log_filter())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Conquest - cell conquest pipeline");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.core.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Database: {}", args.core.db_path.display());
    info!("Grid: {}x{}", args.core.grid_width, args.core.grid_height);
    info!("Payment protocol: {}", args.core.payment.payment_protocol);
    info!(
        "Sweeper: {}",
        if args.no_sweeper {
            "external".to_string()
        } else {
            format!("every {}s", args.sweep_interval_secs)
        }
    );
    info!("======================================");

    let pipeline = Pipeline::from_config(&args.core, args.limits(), args.sweeper())?;

    let sweeper_handle = if args.no_sweeper {
        None
    } else {
        Some(pipeline.sweeper().spawn(pipeline.sweeper_config.interval))
    };

    let cleanup_service = Arc::clone(&pipeline.service);
    let cleanup_every = Duration::from_secs(args.rate_limit_cleanup_secs);
    let cleanup_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_every);
        loop {
            ticker.tick().await;
            // Windows are at most a minute; anything older is dead weight
            cleanup_service.limiter().cleanup(Duration::from_secs(60));
        }
    });

    let purge_handle = args.job_purge_after_secs.map(|secs| {
        let service = Arc::clone(&pipeline.service);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs.clamp(60, 3600)));
            loop {
                ticker.tick().await;
                let cutoff = chrono::Utc::now() - chrono::Duration::seconds(secs as i64);
                if let Err(e) = service.jobs().purge_before(cutoff).await {
                    warn!(error = %e, "Job purge failed");
                }
            }
        })
    });

    let server = Arc::new(HttpServer::new(
        Arc::clone(&pipeline.service),
        Arc::clone(&pipeline.db),
        pipeline.sweeper_config.batch_size,
        args.listen,
    ));

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    if let Some(handle) = sweeper_handle {
        handle.abort();
    }
    if let Some(handle) = purge_handle {
        handle.abort();
    }
    cleanup_handle.abort();

    info!("Conquest stopped");
    Ok(())
}
