//! Direct token transfer through a settlement service
//!
//! The funding credential never leaves the process: a transfer intent is
//! signed locally and posted to `{settlement_url}/transfer`. The service
//! answers with the on-chain signature, used as the settlement reference.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    http_client, require, settlement_amount, PaymentFailure, PaymentGateway, PaymentOutcome,
    PaymentProtocol,
};
use crate::config::PaymentConfig;
use crate::credential::FundingCredential;
use crate::error::Result;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransferIntent<'a> {
    from: &'a str,
    to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mint: Option<&'a str>,
    amount: u64,
    nonce: String,
    signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, alias = "txHash")]
    signature: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct DirectTransferGateway {
    client: reqwest::Client,
    endpoint: String,
    treasury: String,
    mint: Option<String>,
}

impl DirectTransferGateway {
    pub fn new(config: &PaymentConfig) -> Result<Self> {
        let base = require(&config.settlement_url, "SETTLEMENT_URL")?;
        let treasury = require(&config.treasury, "TREASURY_ADDRESS")?;
        Ok(Self {
            client: http_client(config)?,
            endpoint: format!("{}/transfer", base.trim_end_matches('/')),
            treasury: treasury.to_string(),
            mint: config.token_mint.clone(),
        })
    }

    /// Canonical message covered by the transfer signature
    fn intent_message(from: &str, to: &str, mint: Option<&str>, amount: u64, nonce: &str) -> String {
        format!("transfer:{from}:{to}:{}:{amount}:{nonce}", mint.unwrap_or(""))
    }

    async fn transfer(
        &self,
        credential: &FundingCredential,
        units: u64,
    ) -> std::result::Result<String, PaymentFailure> {
        let from = credential.actor_id();
        let nonce = Uuid::new_v4().simple().to_string();
        let mint = self.mint.as_deref();
        let message = Self::intent_message(from.as_str(), &self.treasury, mint, units, &nonce);

        let intent = TransferIntent {
            from: from.as_str(),
            to: &self.treasury,
            mint,
            amount: units,
            signature: credential.sign(message.as_bytes()),
            nonce,
        };

        debug!(actor = %from, amount = units, "Posting transfer intent");
        let response = self.client.post(&self.endpoint).json(&intent).send().await?;
        let status = response.status();
        let body: TransferResponse = response.json().await?;

        match (body.success && status.is_success(), body.signature) {
            (true, Some(signature)) => Ok(signature),
            _ => Err(PaymentFailure::from_message(
                body.error
                    .unwrap_or_else(|| format!("Settlement service returned {status}")),
            )),
        }
    }
}

#[async_trait]
impl PaymentGateway for DirectTransferGateway {
    fn protocol(&self) -> PaymentProtocol {
        PaymentProtocol::Direct
    }

    async fn pay(&self, credential: &FundingCredential, amount: Decimal) -> PaymentOutcome {
        let units = match settlement_amount(amount) {
            Ok(units) => units,
            Err(failure) => return failure.into(),
        };

        match self.transfer(credential, units).await {
            Ok(signature) => {
                info!(actor = %credential.actor_id(), %amount, settlement_ref = %signature, "Transfer settled");
                PaymentOutcome::settled(signature)
            }
            Err(failure) => {
                warn!(actor = %credential.actor_id(), %amount, kind = ?failure.kind, error = %failure.message, "Transfer failed");
                failure.into()
            }
        }
    }
}
