//! Pay-then-verify through a payment facilitator
//!
//! The signed payment payload is first checked with `POST /verify`; only a
//! valid payload is submitted with `POST /settle`. The facilitator's
//! transaction id becomes the settlement reference.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    http_client, require, settlement_amount, FailureKind, PaymentFailure, PaymentGateway,
    PaymentOutcome, PaymentProtocol,
};
use crate::config::PaymentConfig;
use crate::credential::FundingCredential;
use crate::error::Result;

/// Protocol version sent with every payload
const PAYMENT_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequirements {
    scheme: &'static str,
    network: String,
    pay_to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    asset: Option<String>,
    max_amount_required: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentPayload {
    version: u32,
    payer: String,
    amount: String,
    nonce: String,
    signature: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FacilitatorRequest<'a> {
    payment_payload: &'a PaymentPayload,
    payment_requirements: &'a PaymentRequirements,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    #[serde(default)]
    is_valid: bool,
    #[serde(default)]
    invalid_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    transaction: Option<String>,
    #[serde(default)]
    error_reason: Option<String>,
}

pub struct VerifiedPaymentGateway {
    client: reqwest::Client,
    facilitator: String,
    treasury: String,
    asset: Option<String>,
    network: String,
}

impl VerifiedPaymentGateway {
    pub fn new(config: &PaymentConfig) -> Result<Self> {
        let base = require(&config.settlement_url, "SETTLEMENT_URL")?;
        let treasury = require(&config.treasury, "TREASURY_ADDRESS")?;
        Ok(Self {
            client: http_client(config)?,
            facilitator: base.trim_end_matches('/').to_string(),
            treasury: treasury.to_string(),
            asset: config.token_mint.clone(),
            network: config.network.clone(),
        })
    }

    fn payload(&self, credential: &FundingCredential, units: u64) -> (PaymentPayload, PaymentRequirements) {
        let requirements = PaymentRequirements {
            scheme: "exact",
            network: self.network.clone(),
            pay_to: self.treasury.clone(),
            asset: self.asset.clone(),
            max_amount_required: units.to_string(),
        };

        let payer = credential.actor_id().to_string();
        let nonce = Uuid::new_v4().simple().to_string();
        let message = format!(
            "{PAYMENT_VERSION}:{}:{}:{payer}:{units}:{nonce}",
            requirements.network, requirements.pay_to
        );
        let payload = PaymentPayload {
            version: PAYMENT_VERSION,
            signature: credential.sign(message.as_bytes()),
            payer,
            amount: units.to_string(),
            nonce,
        };
        (payload, requirements)
    }

    async fn verify_and_settle(
        &self,
        credential: &FundingCredential,
        units: u64,
    ) -> std::result::Result<String, PaymentFailure> {
        let (payload, requirements) = self.payload(credential, units);
        let request = FacilitatorRequest {
            payment_payload: &payload,
            payment_requirements: &requirements,
        };

        let verify: VerifyResponse = self
            .client
            .post(format!("{}/verify", self.facilitator))
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        if !verify.is_valid {
            let reason = verify
                .invalid_reason
                .unwrap_or_else(|| "Payment payload rejected by facilitator".into());
            return Err(PaymentFailure::from_message(reason));
        }
        debug!(payer = %payload.payer, amount = units, "Payment verified, settling");

        let settle: SettleResponse = self
            .client
            .post(format!("{}/settle", self.facilitator))
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        match (settle.success, settle.transaction) {
            (true, Some(tx)) if !tx.is_empty() => Ok(tx),
            (true, _) => Err(PaymentFailure::new(
                FailureKind::Other,
                "Facilitator settled without a transaction id",
            )),
            (false, _) => Err(PaymentFailure::from_message(
                settle
                    .error_reason
                    .unwrap_or_else(|| "Settlement failed".into()),
            )),
        }
    }
}

#[async_trait]
impl PaymentGateway for VerifiedPaymentGateway {
    fn protocol(&self) -> PaymentProtocol {
        PaymentProtocol::Verified
    }

    async fn pay(&self, credential: &FundingCredential, amount: Decimal) -> PaymentOutcome {
        let units = match settlement_amount(amount) {
            Ok(units) => units,
            Err(failure) => return failure.into(),
        };

        match self.verify_and_settle(credential, units).await {
            Ok(tx) => {
                info!(actor = %credential.actor_id(), %amount, settlement_ref = %tx, "Facilitator settled payment");
                PaymentOutcome::settled(tx)
            }
            Err(failure) => {
                warn!(actor = %credential.actor_id(), %amount, kind = ?failure.kind, error = %failure.message, "Facilitator payment failed");
                failure.into()
            }
        }
    }
}
