//! Configuration
//!
//! CLI arguments and environment variables (clap), with `.env` loaded by the
//! binaries before parsing. [`CoreArgs`] is shared by the server and the
//! standalone sweeper so both open the same database with the same keys.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::credential::CredentialSealer;
use crate::error::{ConquestError, Result};
use crate::grid::{GridBounds, DEFAULT_GRID_HEIGHT, DEFAULT_GRID_WIDTH};
use crate::jobs::sweeper::{DEFAULT_SWEEP_BATCH, DEFAULT_SWEEP_INTERVAL};
use crate::jobs::DEFAULT_JOB_RETENTION;
use crate::payment::PaymentProtocol;
use crate::rate_limit::RatePolicy;
use crate::validator::DEFAULT_MAX_BATCH;

/// Conquest - grid cell conquest pipeline server
#[derive(Parser, Debug, Clone)]
#[command(name = "conquest")]
#[command(about = "Grid cell conquest pipeline: pricing, payment, commit and job sweeping")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8090")]
    pub listen: SocketAddr,

    #[command(flatten)]
    pub core: CoreArgs,

    /// Conquests per actor per minute
    #[arg(long, env = "CONQUER_RATE_LIMIT", default_value = "10")]
    pub conquer_rate_limit: u32,

    /// Recolors per actor per minute
    #[arg(long, env = "RECOLOR_RATE_LIMIT", default_value = "30")]
    pub recolor_rate_limit: u32,

    /// Job status polls per job per minute
    #[arg(long, env = "POLL_RATE_LIMIT", default_value = "120")]
    pub poll_rate_limit: u32,

    /// Manual sweep triggers per minute
    #[arg(long, env = "SWEEP_RATE_LIMIT", default_value = "6")]
    pub sweep_rate_limit: u32,

    /// Don't run the in-process sweeper loop (use an external scheduler)
    #[arg(long, env = "NO_SWEEPER", default_value = "false")]
    pub no_sweeper: bool,

    /// Seconds between in-process sweeper ticks
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL.as_secs())]
    pub sweep_interval_secs: u64,

    /// Seconds between rate limiter cleanups
    #[arg(long, env = "RATE_LIMIT_CLEANUP_SECS", default_value = "300")]
    pub rate_limit_cleanup_secs: u64,

    /// Delete finished jobs older than this many seconds (disabled when unset)
    #[arg(long, env = "JOB_PURGE_AFTER_SECS")]
    pub job_purge_after_secs: Option<u64>,
}

/// Settings shared by every binary
#[derive(clap::Args, Debug, Clone)]
pub struct CoreArgs {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "./data/conquest.db")]
    pub db_path: PathBuf,

    /// Enable development mode (fixed sealing key, simulated payments allowed)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Grid width in cells
    #[arg(long, env = "GRID_WIDTH", default_value_t = DEFAULT_GRID_WIDTH)]
    pub grid_width: u32,

    /// Grid height in cells
    #[arg(long, env = "GRID_HEIGHT", default_value_t = DEFAULT_GRID_HEIGHT)]
    pub grid_height: u32,

    /// Maximum cells per request
    #[arg(long, env = "MAX_BATCH_SIZE", default_value_t = DEFAULT_MAX_BATCH)]
    pub max_batch: usize,

    /// Batches larger than this are queued as jobs instead of run inline
    #[arg(long, env = "ASYNC_THRESHOLD", default_value = "20")]
    pub async_threshold: usize,

    /// Seconds a job stays visible; older pending jobs are expired by the sweeper
    #[arg(long, env = "JOB_RETENTION_SECS", default_value_t = DEFAULT_JOB_RETENTION.as_secs())]
    pub job_retention_secs: u64,

    /// Pending jobs drained per sweeper tick
    #[arg(long, env = "SWEEP_BATCH", default_value_t = DEFAULT_SWEEP_BATCH)]
    pub sweep_batch: usize,

    /// 32-byte hex key sealing credentials stored with jobs (required in production)
    #[arg(long, env = "JOB_SEALING_KEY", hide_env_values = true)]
    pub job_sealing_key: Option<String>,

    #[command(flatten)]
    pub payment: PaymentArgs,
}

/// Settlement configuration
#[derive(clap::Args, Debug, Clone)]
pub struct PaymentArgs {
    /// Payment protocol
    #[arg(long, env = "PAYMENT_PROTOCOL", value_enum, default_value_t = PaymentProtocol::Simulated)]
    pub payment_protocol: PaymentProtocol,

    /// Settlement service (direct) or facilitator (verified) base URL
    #[arg(long, env = "SETTLEMENT_URL")]
    pub settlement_url: Option<String>,

    /// Treasury address receiving payments
    #[arg(long, env = "TREASURY_ADDRESS")]
    pub treasury_address: Option<String>,

    /// Settlement token mint
    #[arg(long, env = "TOKEN_MINT")]
    pub token_mint: Option<String>,

    /// Settlement network identifier sent to the facilitator
    #[arg(long, env = "SETTLEMENT_NETWORK", default_value = "solana-devnet")]
    pub settlement_network: String,

    /// Settlement request timeout in milliseconds
    #[arg(long, env = "SETTLEMENT_TIMEOUT_MS", default_value = "30000")]
    pub settlement_timeout_ms: u64,

    /// Simulated settlement minimum latency in milliseconds
    #[arg(long, env = "SIMULATED_MIN_LATENCY_MS", default_value = "500")]
    pub simulated_min_latency_ms: u64,

    /// Simulated settlement maximum latency in milliseconds
    #[arg(long, env = "SIMULATED_MAX_LATENCY_MS", default_value = "1500")]
    pub simulated_max_latency_ms: u64,

    /// Simulated settlement failure rate (0.0 - 1.0)
    #[arg(long, env = "SIMULATED_FAILURE_RATE", default_value = "0.05")]
    pub simulated_failure_rate: f64,
}

impl CoreArgs {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.grid_width == 0 || self.grid_height == 0 {
            return Err("GRID_WIDTH and GRID_HEIGHT must be greater than 0".to_string());
        }
        if self.max_batch == 0 {
            return Err("MAX_BATCH_SIZE must be greater than 0".to_string());
        }
        if self.async_threshold > self.max_batch {
            return Err("ASYNC_THRESHOLD must be less than or equal to MAX_BATCH_SIZE".to_string());
        }
        if self.sweep_batch == 0 {
            return Err("SWEEP_BATCH must be greater than 0".to_string());
        }

        if !self.dev_mode {
            match &self.job_sealing_key {
                None => return Err("JOB_SEALING_KEY is required in production mode".to_string()),
                Some(key) => {
                    CredentialSealer::from_hex(key).map_err(|e| e.to_string())?;
                }
            }
            if self.payment.payment_protocol == PaymentProtocol::Simulated {
                return Err("Simulated payments are only allowed in development mode".to_string());
            }
        }

        let payment = &self.payment;
        if !(0.0..=1.0).contains(&payment.simulated_failure_rate) {
            return Err("SIMULATED_FAILURE_RATE must be between 0.0 and 1.0".to_string());
        }
        if payment.payment_protocol != PaymentProtocol::Simulated {
            if payment.settlement_url.as_deref().map_or(true, str::is_empty) {
                return Err(format!(
                    "SETTLEMENT_URL is required for the {} payment protocol",
                    payment.payment_protocol
                ));
            }
            if payment.treasury_address.as_deref().map_or(true, str::is_empty) {
                return Err(format!(
                    "TREASURY_ADDRESS is required for the {} payment protocol",
                    payment.payment_protocol
                ));
            }
        }
        Ok(())
    }

    /// Sealing key from config, or the fixed development key in dev mode
    pub fn sealer(&self) -> Result<CredentialSealer> {
        match (&self.job_sealing_key, self.dev_mode) {
            (Some(key), _) => CredentialSealer::from_hex(key),
            (None, true) => Ok(CredentialSealer::development()),
            (None, false) => Err(ConquestError::Config(
                "JOB_SEALING_KEY is required in production mode".into(),
            )),
        }
    }

    pub fn grid(&self) -> GridConfig {
        GridConfig {
            bounds: GridBounds {
                width: self.grid_width,
                height: self.grid_height,
            },
            max_batch: self.max_batch,
            async_threshold: self.async_threshold,
        }
    }

    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            batch_size: self.sweep_batch,
            job_retention: Duration::from_secs(self.job_retention_secs),
            ..SweeperConfig::default()
        }
    }

    pub fn payment(&self) -> PaymentConfig {
        let p = &self.payment;
        PaymentConfig {
            protocol: p.payment_protocol,
            settlement_url: p.settlement_url.clone(),
            treasury: p.treasury_address.clone(),
            token_mint: p.token_mint.clone(),
            network: p.settlement_network.clone(),
            timeout: Duration::from_millis(p.settlement_timeout_ms),
            simulated_min_latency: Duration::from_millis(p.simulated_min_latency_ms),
            simulated_max_latency: Duration::from_millis(p.simulated_max_latency_ms),
            simulated_failure_rate: p.simulated_failure_rate,
        }
    }

    /// Filter used when `RUST_LOG` is unset
    pub fn default_log_filter(&self) -> String {
        format!("conquest={},info", self.log_level)
    }
}

impl Args {
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.core.validate()?;
        if self.sweep_interval_secs == 0 {
            return Err("SWEEP_INTERVAL_SECS must be greater than 0".to_string());
        }
        if self.rate_limit_cleanup_secs == 0 {
            return Err("RATE_LIMIT_CLEANUP_SECS must be greater than 0".to_string());
        }
        for (name, value) in [
            ("CONQUER_RATE_LIMIT", self.conquer_rate_limit),
            ("RECOLOR_RATE_LIMIT", self.recolor_rate_limit),
            ("POLL_RATE_LIMIT", self.poll_rate_limit),
            ("SWEEP_RATE_LIMIT", self.sweep_rate_limit),
        ] {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }
        Ok(())
    }

    pub fn limits(&self) -> LimitsConfig {
        LimitsConfig {
            conquer: RatePolicy::per_minute(self.conquer_rate_limit),
            recolor: RatePolicy::per_minute(self.recolor_rate_limit),
            poll: RatePolicy::per_minute(self.poll_rate_limit),
            sweep: RatePolicy::per_minute(self.sweep_rate_limit),
        }
    }

    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.sweep_interval_secs),
            ..self.core.sweeper()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridConfig {
    pub bounds: GridBounds,
    pub max_batch: usize,
    pub async_threshold: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            bounds: GridBounds::default(),
            max_batch: DEFAULT_MAX_BATCH,
            async_threshold: 20,
        }
    }
}

/// Admission policies per entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitsConfig {
    pub conquer: RatePolicy,
    pub recolor: RatePolicy,
    pub poll: RatePolicy,
    pub sweep: RatePolicy,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            conquer: RatePolicy::per_minute(10),
            recolor: RatePolicy::per_minute(30),
            poll: RatePolicy::per_minute(120),
            sweep: RatePolicy::per_minute(6),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperConfig {
    pub batch_size: usize,
    pub interval: Duration,
    pub job_retention: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SWEEP_BATCH,
            interval: DEFAULT_SWEEP_INTERVAL,
            job_retention: DEFAULT_JOB_RETENTION,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentConfig {
    pub protocol: PaymentProtocol,
    pub settlement_url: Option<String>,
    pub treasury: Option<String>,
    pub token_mint: Option<String>,
    pub network: String,
    pub timeout: Duration,
    pub simulated_min_latency: Duration,
    pub simulated_max_latency: Duration,
    pub simulated_failure_rate: f64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            protocol: PaymentProtocol::Simulated,
            settlement_url: None,
            treasury: None,
            token_mint: None,
            network: "solana-devnet".to_string(),
            timeout: Duration::from_secs(30),
            simulated_min_latency: Duration::from_millis(500),
            simulated_max_latency: Duration::from_millis(1500),
            simulated_failure_rate: 0.05,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["conquest"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_dev_mode_defaults_are_valid() {
        let args = parse(&["--dev-mode"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.core.grid().bounds, GridBounds::default());
        assert_eq!(args.limits(), LimitsConfig::default());
        assert!(args.core.sealer().is_ok());
    }

    #[test]
    fn test_production_requires_sealing_key_and_real_payments() {
        let args = parse(&[]);
        assert!(args.validate().unwrap_err().contains("JOB_SEALING_KEY"));

        let key = "ab".repeat(32);
        let args = parse(&["--job-sealing-key", &key]);
        assert!(args.validate().unwrap_err().contains("Simulated"));

        let args = parse(&["--job-sealing-key", &key, "--payment-protocol", "direct"]);
        assert!(args.validate().unwrap_err().contains("SETTLEMENT_URL"));

        let args = parse(&[
            "--job-sealing-key",
            &key,
            "--payment-protocol",
            "verified",
            "--settlement-url",
            "https://facilitator.example",
            "--treasury-address",
            "Treasury1111",
        ]);
        assert!(args.validate().is_ok());
        assert_eq!(args.core.payment().protocol, PaymentProtocol::Verified);
    }

    #[test]
    fn test_async_threshold_cannot_exceed_max_batch() {
        let args = parse(&["--dev-mode", "--max-batch", "10", "--async-threshold", "11"]);
        assert!(args.validate().is_err());
    }
}
