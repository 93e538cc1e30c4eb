//! Development settlement: random latency, random failures, fake references

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::{settlement_amount, FailureKind, PaymentGateway, PaymentOutcome, PaymentProtocol};
use crate::credential::FundingCredential;

const BASE58_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Length of a fake settlement reference (same as a base58 transaction signature)
const SIMULATED_REF_LEN: usize = 88;

pub struct SimulatedGateway {
    min_latency: Duration,
    max_latency: Duration,
    failure_rate: f64,
}

impl SimulatedGateway {
    pub fn new(min_latency: Duration, max_latency: Duration, failure_rate: f64) -> Self {
        Self {
            min_latency,
            max_latency: max_latency.max(min_latency),
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    /// No latency, never fails (tests)
    pub fn instant() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 0.0)
    }

    fn fake_ref(rng: &mut impl Rng) -> String {
        (0..SIMULATED_REF_LEN)
            .map(|_| BASE58_ALPHABET[rng.gen_range(0..BASE58_ALPHABET.len())] as char)
            .collect()
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_millis(1500), 0.05)
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    fn protocol(&self) -> PaymentProtocol {
        PaymentProtocol::Simulated
    }

    async fn pay(&self, credential: &FundingCredential, amount: Decimal) -> PaymentOutcome {
        if let Err(failure) = settlement_amount(amount) {
            return failure.into();
        }

        // ThreadRng is not Send, so draw everything before the await
        let (delay, fails, settlement_ref) = {
            let mut rng = rand::thread_rng();
            let delay = if self.max_latency > self.min_latency {
                rng.gen_range(self.min_latency..=self.max_latency)
            } else {
                self.min_latency
            };
            let fails = rng.gen_bool(self.failure_rate);
            (delay, fails, Self::fake_ref(&mut rng))
        };

        tokio::time::sleep(delay).await;

        if fails {
            warn!(actor = %credential.actor_id(), %amount, "Simulated payment failure");
            return PaymentOutcome::failed(FailureKind::Network, "Simulated network failure");
        }

        debug!(actor = %credential.actor_id(), %amount, settlement_ref = %settlement_ref, "Simulated payment settled");
        PaymentOutcome::settled(settlement_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn test_instant_gateway_settles_with_base58_ref() {
        let gateway = SimulatedGateway::instant();
        let outcome = gateway
            .pay(&FundingCredential::generate(), Decimal::from_str("0.02").unwrap())
            .await;

        let PaymentOutcome::Settled { settlement_ref } = outcome else {
            panic!("expected settlement, got {outcome:?}");
        };
        assert_eq!(settlement_ref.len(), SIMULATED_REF_LEN);
        assert!(bs58::decode(&settlement_ref).into_vec().is_ok());
    }

    #[tokio::test]
    async fn test_always_failing_gateway() {
        let gateway = SimulatedGateway::new(Duration::ZERO, Duration::ZERO, 1.0);
        let outcome = gateway.pay(&FundingCredential::generate(), Decimal::ONE).await;
        assert!(matches!(
            outcome,
            PaymentOutcome::Failed(ref f) if f.kind == FailureKind::Network
        ));
    }

    #[tokio::test]
    async fn test_zero_amount_is_rejected_before_transfer() {
        let gateway = SimulatedGateway::instant();
        let outcome = gateway.pay(&FundingCredential::generate(), Decimal::ZERO).await;
        assert!(matches!(
            outcome,
            PaymentOutcome::Failed(ref f) if f.kind == FailureKind::InvalidAmount
        ));
    }
}
