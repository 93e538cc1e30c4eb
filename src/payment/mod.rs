//! Payment gateway
//!
//! Moves funds from an actor's funding account to the treasury. This is the
//! one slow external call in the pipeline, and it may appear to fail after it
//! actually settled, so gateways never retry on their own.
//!
//! Failures are values ([`PaymentFailure`]), not errors: every reason is
//! something the caller records into a job result or shows to the client.
//!
//! ## Protocols
//!
//! - [`DirectTransferGateway`] - signed transfer intent posted to a settlement service
//! - [`VerifiedPaymentGateway`] - verify-then-settle against a payment facilitator
//! - [`SimulatedGateway`] - development settlement with latency and random failures

mod direct;
mod simulated;
mod verified;

#[cfg(test)]
mod stub_service;

pub use direct::DirectTransferGateway;
pub use simulated::SimulatedGateway;
pub use verified::VerifiedPaymentGateway;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::PaymentConfig;
use crate::credential::FundingCredential;
use crate::error::{ConquestError, Result};
use crate::pricing::to_minor_units;

/// Settlement protocol, chosen once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProtocol {
    Direct,
    Verified,
    Simulated,
}

impl fmt::Display for PaymentProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PaymentProtocol::Direct => "direct",
            PaymentProtocol::Verified => "verified",
            PaymentProtocol::Simulated => "simulated",
        })
    }
}

/// Why a payment did not settle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Cancelled,
    InsufficientFunds,
    AccountNotFound,
    Network,
    InvalidAmount,
    Other,
}

impl FailureKind {
    /// What the client can do about it
    pub fn hint(&self) -> &'static str {
        match self {
            FailureKind::Cancelled => "The transfer was cancelled",
            FailureKind::InsufficientFunds => "Top up the funding account and try again",
            FailureKind::AccountNotFound => {
                "Funding token account not found. Fund the account first"
            }
            FailureKind::Network => "Network error, retry later",
            FailureKind::InvalidAmount => "Payment amount must be greater than 0",
            FailureKind::Other => "Payment failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl PaymentFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a free-form settlement error message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_failure(&message),
            message,
        }
    }
}

impl From<reqwest::Error> for PaymentFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            PaymentFailure::new(FailureKind::Network, format!("Settlement request failed: {err}"))
        } else {
            PaymentFailure::from_message(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Settled { settlement_ref: String },
    Failed(PaymentFailure),
}

impl PaymentOutcome {
    pub fn settled(settlement_ref: impl Into<String>) -> Self {
        PaymentOutcome::Settled {
            settlement_ref: settlement_ref.into(),
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        PaymentOutcome::Failed(PaymentFailure::new(kind, message))
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, PaymentOutcome::Settled { .. })
    }
}

impl From<PaymentFailure> for PaymentOutcome {
    fn from(failure: PaymentFailure) -> Self {
        PaymentOutcome::Failed(failure)
    }
}

/// Transfer `amount` from the credential's funding account to the treasury
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn protocol(&self) -> PaymentProtocol;

    async fn pay(&self, credential: &FundingCredential, amount: Decimal) -> PaymentOutcome;
}

/// Match settlement error text to a failure kind
pub fn classify_failure(message: &str) -> FailureKind {
    let msg = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if has(&["rejected", "cancelled", "canceled"]) {
        FailureKind::Cancelled
    } else if has(&["insufficient", "not enough"]) {
        FailureKind::InsufficientFunds
    } else if has(&["account not found", "token account", "could not find"]) {
        FailureKind::AccountNotFound
    } else if has(&["timeout", "timed out", "network", "fetch"]) {
        FailureKind::Network
    } else {
        FailureKind::Other
    }
}

/// Reject non-positive amounts and convert to integer minor units
pub(crate) fn settlement_amount(amount: Decimal) -> std::result::Result<u64, PaymentFailure> {
    match to_minor_units(amount) {
        Some(units) if amount > Decimal::ZERO && units > 0 => Ok(units),
        _ => Err(PaymentFailure::new(
            FailureKind::InvalidAmount,
            format!("Payment amount must be greater than 0, got {amount}"),
        )),
    }
}

/// Build the configured gateway
pub fn build_gateway(config: &PaymentConfig) -> Result<Arc<dyn PaymentGateway>> {
    let gateway: Arc<dyn PaymentGateway> = match config.protocol {
        PaymentProtocol::Direct => Arc::new(DirectTransferGateway::new(config)?),
        PaymentProtocol::Verified => Arc::new(VerifiedPaymentGateway::new(config)?),
        PaymentProtocol::Simulated => Arc::new(SimulatedGateway::new(
            config.simulated_min_latency,
            config.simulated_max_latency,
            config.simulated_failure_rate,
        )),
    };
    info!(protocol = %gateway.protocol(), "Payment gateway ready");
    Ok(gateway)
}

/// Settlement URL and treasury are required by the network-backed protocols
pub(crate) fn require<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConquestError::Config(format!("{name} is required for this payment protocol")))
}

pub(crate) fn http_client(config: &PaymentConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|e| ConquestError::Config(format!("Failed to create HTTP client: {e}")))
}
