//! Conquest service
//!
//! Wires the pipeline together: admission, validation, then either inline
//! execution or a durable job, then payment and commit. Payment and commit
//! failures end up in a [`ConquestResult`]; only input and admission problems
//! are returned as errors.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::committer::{CommitOutcome, ConquestCommitter};
use crate::config::{GridConfig, LimitsConfig};
use crate::credential::FundingCredential;
use crate::error::{ConquestError, Result};
use crate::grid::{ActorId, Cell, CellRequest};
use crate::jobs::{ConquestResult, JobQueue, JobStatus, JobView};
use crate::payment::{PaymentGateway, PaymentOutcome};
use crate::rate_limit::{RateLimiter, RatePolicy};
use crate::store::{BatchReport, CellResult, CellStore};
use crate::validator::{BatchValidator, Quote, ValidatedBatch};

/// Rate limiter key for manual sweep triggers
const SWEEP_KEY: &str = "sweep";

/// A conquest request with its parsed credential
#[derive(Debug)]
pub struct ConquestRequest {
    pub credential: FundingCredential,
    pub cells: Vec<CellRequest>,
    /// Queue the batch even if it is small enough to run inline
    pub force_async: bool,
}

/// Outcome of a batch executed within the request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConquestReceipt {
    pub actor_id: ActorId,
    pub total_price: Decimal,
    pub result: ConquestResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Completed(ConquestReceipt),
    Queued { job_id: String, total_price: Decimal },
}

pub struct ConquestService {
    store: Arc<dyn CellStore>,
    validator: BatchValidator,
    committer: ConquestCommitter,
    gateway: Arc<dyn PaymentGateway>,
    jobs: Arc<JobQueue>,
    limiter: Arc<RateLimiter>,
    limits: LimitsConfig,
    grid: GridConfig,
}

impl ConquestService {
    pub fn new(
        store: Arc<dyn CellStore>,
        gateway: Arc<dyn PaymentGateway>,
        jobs: Arc<JobQueue>,
        limiter: Arc<RateLimiter>,
        grid: GridConfig,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            validator: BatchValidator::new(Arc::clone(&store), grid.bounds, grid.max_batch),
            committer: ConquestCommitter::new(Arc::clone(&store)),
            store,
            gateway,
            jobs,
            limiter,
            limits,
            grid,
        }
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn grid(&self) -> GridConfig {
        self.grid
    }

    fn admit(&self, key: &str, policy: RatePolicy) -> Result<()> {
        let admission = self.limiter.admit(key, policy);
        if admission.allowed {
            return Ok(());
        }
        let reset_at_ms = admission
            .reset_at
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        warn!(key, reset_at_ms, "Rate limit exceeded");
        Err(ConquestError::RateLimited { reset_at_ms })
    }

    /// Accept a conquest request and run it inline or queue it
    pub async fn submit(self: &Arc<Self>, request: ConquestRequest) -> Result<SubmitOutcome> {
        let actor = request.credential.actor_id();
        self.admit(&format!("conquer:{actor}"), self.limits.conquer)?;

        let batch = self.validator.validate(&actor, &request.cells).await?;
        let total_price = batch.total_price;

        if batch.is_free() {
            info!(actor = %actor, cells = batch.cell_count(), "Pure recolor, no payment needed");
            let outcome = self
                .committer
                .commit(&actor, &[], &batch.to_recolor, None)
                .await?;
            return Ok(SubmitOutcome::Completed(ConquestReceipt {
                actor_id: actor,
                total_price,
                result: ConquestResult::from_commit(None, outcome),
            }));
        }

        if batch.cell_count() <= self.grid.async_threshold && !request.force_async {
            let result = self.execute(&actor, &request.credential, &batch).await;
            return Ok(SubmitOutcome::Completed(ConquestReceipt {
                actor_id: actor,
                total_price,
                result,
            }));
        }

        let job_id = self
            .jobs
            .enqueue(&actor, batch, &request.credential)
            .await?;
        let service = Arc::clone(self);
        let background_id = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = service.run_job(&background_id).await {
                error!(job_id = %background_id, error = %e, "Background job failed");
            }
        });

        Ok(SubmitOutcome::Queued {
            job_id,
            total_price,
        })
    }

    /// Free recolor of cells the actor owns; other cells come back skipped
    pub async fn recolor(
        &self,
        credential: &FundingCredential,
        cells: &[CellRequest],
    ) -> Result<ConquestReceipt> {
        let actor = credential.actor_id();
        self.admit(&format!("recolor:{actor}"), self.limits.recolor)?;

        let batch = self.validator.validate(&actor, cells).await?;
        let not_owned = batch
            .to_conquer
            .iter()
            .map(|entry| CellResult::skipped(entry.coord, "Not owned by actor"));
        let not_owned = BatchReport::from_results(not_owned.collect());

        let result = match self
            .committer
            .commit(&actor, &[], &batch.to_recolor, None)
            .await?
        {
            CommitOutcome::Committed(report) => ConquestResult::Completed {
                settlement_ref: None,
                report: report.merge(not_owned),
            },
            other => ConquestResult::from_commit(None, other),
        };

        Ok(ConquestReceipt {
            actor_id: actor,
            total_price: Decimal::ZERO,
            result,
        })
    }

    /// Pay, then commit. Payment precedes commit, always.
    async fn execute(
        &self,
        actor: &ActorId,
        credential: &FundingCredential,
        batch: &ValidatedBatch,
    ) -> ConquestResult {
        let settlement_ref = match self.gateway.pay(credential, batch.total_price).await {
            PaymentOutcome::Settled { settlement_ref } => settlement_ref,
            PaymentOutcome::Failed(failure) => {
                warn!(actor = %actor, kind = ?failure.kind, error = %failure.message, "Payment failed");
                return ConquestResult::PaymentFailed { failure };
            }
        };

        match self
            .committer
            .commit(
                actor,
                &batch.to_conquer,
                &batch.to_recolor,
                Some(&settlement_ref),
            )
            .await
        {
            Ok(outcome) => ConquestResult::from_commit(Some(settlement_ref), outcome),
            Err(e) => {
                error!(actor = %actor, settlement_ref = %settlement_ref, error = %e, "Commit failed after payment");
                ConquestResult::PaidButNotCommitted {
                    settlement_ref,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Claim a job and drive it to a terminal status.
    ///
    /// Returns `None` when another worker already claimed it.
    pub async fn run_job(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let Some(claimed) = self.jobs.claim(job_id).await? else {
            return Ok(None);
        };
        let job = &claimed.job;

        let result = if self.jobs.is_expired(job) {
            warn!(job_id, created_at = %job.created_at, "Pending job expired before processing");
            ConquestResult::Expired {
                reason: "Job expired before it could be processed; no payment was made".into(),
            }
        } else {
            info!(job_id, actor = %job.actor_id, total_price = %job.total_price, "Processing job");
            self.execute(&job.actor_id, &claimed.credential, &job.batch).await
        };

        let status = result.status();
        if let ConquestResult::PaidButNotCommitted { settlement_ref, .. } = &result {
            error!(job_id, settlement_ref = %settlement_ref, "Job paid but not committed, needs reconciliation");
        }
        self.record_result(job_id, status, result).await?;
        info!(job_id, %status, "Job finished");
        Ok(Some(status))
    }

    /// Write the terminal status, retrying once. Past this point money may
    /// have moved, so a failure logs the settlement reference before giving up.
    async fn record_result(
        &self,
        job_id: &str,
        status: JobStatus,
        result: ConquestResult,
    ) -> Result<()> {
        let settlement_ref = result.settlement_ref().map(str::to_owned);
        let first = match self
            .jobs
            .transition(job_id, status, Some(result.clone()))
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        error!(
            job_id,
            %status,
            settlement_ref = settlement_ref.as_deref().unwrap_or("none"),
            error = %first,
            "Could not record job result, retrying"
        );

        if let Err(e) = self.jobs.transition(job_id, status, Some(result)).await {
            error!(
                job_id,
                %status,
                settlement_ref = settlement_ref.as_deref().unwrap_or("none"),
                error = %e,
                "Job result lost, job left processing"
            );
            return Err(match settlement_ref {
                Some(settlement_ref) => ConquestError::Internal(format!(
                    "Job {job_id} settled as {settlement_ref} but its result could not be recorded: {e}"
                )),
                None => e,
            });
        }
        Ok(())
    }

    /// Client-facing job status
    pub async fn poll_job(&self, job_id: &str) -> Result<JobView> {
        self.admit(&format!("poll:{job_id}"), self.limits.poll)?;
        self.jobs.get(job_id).await
    }

    pub async fn quote(&self, actor: Option<&ActorId>, cells: &[CellRequest]) -> Result<Quote> {
        self.validator.quote(actor, cells).await
    }

    pub async fn get_cell(&self, x: i64, y: i64) -> Result<Cell> {
        let coord = self.grid.bounds.coord(x, y)?;
        self.store
            .get_cell(coord)
            .await?
            .ok_or(ConquestError::CellNotFound {
                x: coord.x,
                y: coord.y,
            })
    }

    /// Admission for externally triggered sweeps
    pub fn admit_sweep(&self) -> Result<()> {
        self.admit(SWEEP_KEY, self.limits.sweep)
    }
}
