//! Conquest committer
//!
//! Applies a paid (or free) batch through the store. A store failure after a
//! successful payment is never turned into a generic error: it comes back as
//! [`CommitOutcome::PaidButNotCommitted`] with the settlement reference so the
//! transfer can be reconciled.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{ConquestError, Result};
use crate::grid::ActorId;
use crate::store::{BatchReport, CellResult, CellStore, ConquerEntry, RecolorEntry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed(BatchReport),
    #[serde(rename_all = "camelCase")]
    PaidButNotCommitted {
        settlement_ref: String,
        reason: String,
    },
}

pub struct ConquestCommitter {
    store: Arc<dyn CellStore>,
}

impl ConquestCommitter {
    pub fn new(store: Arc<dyn CellStore>) -> Self {
        Self { store }
    }

    /// Commit conquests (requires `settlement_ref`) and recolors (free).
    ///
    /// Conquests are applied first, in the store's single atomic batch for
    /// `settlement_ref`. Recolors are applied afterwards and never affect the
    /// paid part of the outcome.
    pub async fn commit(
        &self,
        actor: &ActorId,
        to_conquer: &[ConquerEntry],
        to_recolor: &[RecolorEntry],
        settlement_ref: Option<&str>,
    ) -> Result<CommitOutcome> {
        let conquered = match (to_conquer.is_empty(), settlement_ref) {
            (true, _) => BatchReport::empty(),
            (false, None) => {
                return Err(ConquestError::Internal(
                    "Conquest commit attempted without a settlement reference".into(),
                ))
            }
            (false, Some(settlement_ref)) => {
                match self
                    .store
                    .batch_conquer(to_conquer, actor, settlement_ref)
                    .await
                {
                    Ok(report) => report,
                    Err(e) => {
                        error!(
                            actor = %actor,
                            settlement_ref,
                            cells = to_conquer.len(),
                            error = %e,
                            "Payment succeeded but database update failed"
                        );
                        return Ok(CommitOutcome::PaidButNotCommitted {
                            settlement_ref: settlement_ref.to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        };

        let recolored = if to_recolor.is_empty() {
            BatchReport::empty()
        } else {
            match self.store.recolor(to_recolor, actor).await {
                Ok(report) => report,
                // Conquests are already durable; a failed free recolor must not mask them
                Err(e) if settlement_ref.is_some() && !to_conquer.is_empty() => {
                    error!(actor = %actor, error = %e, "Recolor failed after committed conquest");
                    BatchReport::from_results(
                        to_recolor
                            .iter()
                            .map(|entry| CellResult::error(entry.coord, e.to_string()))
                            .collect(),
                    )
                }
                Err(e) => return Err(e),
            }
        };

        let report = conquered.merge(recolored);
        info!(
            actor = %actor,
            success = report.success_count,
            skipped = report.skipped_count,
            errors = report.error_count,
            "Batch committed"
        );
        Ok(CommitOutcome::Committed(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{Cell, Color, Coord};
    use async_trait::async_trait;
    use rust_decimal::Decimal;

    struct FailingStore;

    #[async_trait]
    impl CellStore for FailingStore {
        async fn fetch_cells(&self, _coords: &[Coord]) -> Result<Vec<Cell>> {
            Ok(Vec::new())
        }

        async fn get_cell(&self, _coord: Coord) -> Result<Option<Cell>> {
            Ok(None)
        }

        async fn batch_conquer(
            &self,
            _entries: &[ConquerEntry],
            _actor: &ActorId,
            _settlement_ref: &str,
        ) -> Result<BatchReport> {
            Err(ConquestError::Internal("disk full".into()))
        }

        async fn recolor(&self, _entries: &[RecolorEntry], _actor: &ActorId) -> Result<BatchReport> {
            Err(ConquestError::Internal("disk full".into()))
        }
    }

    fn conquer_entry() -> ConquerEntry {
        ConquerEntry {
            coord: Coord::new(1, 1),
            color: Color::parse("#ABCDEF").unwrap(),
            quoted_price: Decimal::ONE,
        }
    }

    #[tokio::test]
    async fn test_store_failure_after_payment_keeps_settlement_ref() {
        let committer = ConquestCommitter::new(Arc::new(FailingStore));
        let outcome = committer
            .commit(&ActorId::new("a"), &[conquer_entry()], &[], Some("sig-123"))
            .await
            .unwrap();

        match outcome {
            CommitOutcome::PaidButNotCommitted {
                settlement_ref,
                reason,
            } => {
                assert_eq!(settlement_ref, "sig-123");
                assert!(reason.contains("disk full"));
            }
            other => panic!("expected PaidButNotCommitted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_conquest_without_settlement_ref_is_refused() {
        let committer = ConquestCommitter::new(Arc::new(FailingStore));
        let result = committer
            .commit(&ActorId::new("a"), &[conquer_entry()], &[], None)
            .await;
        assert!(matches!(result, Err(ConquestError::Internal(_))));
    }

    #[tokio::test]
    async fn test_free_recolor_failure_is_an_error() {
        let committer = ConquestCommitter::new(Arc::new(FailingStore));
        let recolor = RecolorEntry {
            coord: Coord::new(0, 0),
            color: Color::parse("#000000").unwrap(),
        };
        let result = committer
            .commit(&ActorId::new("a"), &[], &[recolor], None)
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_unreconciled_outcome_uses_camel_case_fields() {
        let outcome = CommitOutcome::PaidButNotCommitted {
            settlement_ref: "sig-123".into(),
            reason: "disk full".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "paid_but_not_committed");
        assert_eq!(json["settlementRef"], "sig-123");
    }
}
