//! Durable conquest job queue
//!
//! Batches too large (or too slow) for one request are written to the `jobs`
//! table and executed in the background. A job record is the only place a
//! queued batch lives, so a replaced process loses nothing: the sweeper finds
//! the job still `pending` and drives it.
//!
//! Lifecycle: `pending -> processing -> completed | failed`. Only the worker
//! that claimed a job (the conditional `pending -> processing` update) mutates
//! it afterwards.

pub mod sweeper;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::committer::CommitOutcome;
use crate::credential::{CredentialSealer, FundingCredential};
use crate::db::{jobs as job_rows, ConquestDb};
use crate::error::{ConquestError, Result};
use crate::grid::ActorId;
use crate::payment::PaymentFailure;
use crate::store::BatchReport;
use crate::validator::ValidatedBatch;

pub use sweeper::{SweepReport, Sweeper};

/// Jobs older than this are reported as not found and expired by the sweeper
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Poll hint while a job waits to be claimed
pub const PENDING_RETRY_AFTER_SECS: u64 = 2;

/// Poll hint while a job is being paid and committed
pub const PROCESSING_RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ConquestError::Internal(format!("Unknown job status: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Only forward moves along `pending -> processing -> {completed, failed}`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            JobStatus::Pending => Some(PENDING_RETRY_AFTER_SECS),
            JobStatus::Processing => Some(PROCESSING_RETRY_AFTER_SECS),
            JobStatus::Completed | JobStatus::Failed => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of executing a batch, inline or as a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConquestResult {
    #[serde(rename_all = "camelCase")]
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settlement_ref: Option<String>,
        report: BatchReport,
    },
    #[serde(rename_all = "camelCase")]
    PaymentFailed {
        failure: PaymentFailure,
    },
    /// Funds moved but ownership was not recorded; needs reconciliation
    #[serde(rename_all = "camelCase")]
    PaidButNotCommitted {
        settlement_ref: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Expired {
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Internal {
        reason: String,
    },
}

impl ConquestResult {
    pub fn from_commit(settlement_ref: Option<String>, outcome: CommitOutcome) -> Self {
        match outcome {
            CommitOutcome::Committed(report) => ConquestResult::Completed {
                settlement_ref,
                report,
            },
            CommitOutcome::PaidButNotCommitted {
                settlement_ref,
                reason,
            } => ConquestResult::PaidButNotCommitted {
                settlement_ref,
                reason,
            },
        }
    }

    /// Terminal job status this result maps to
    pub fn status(&self) -> JobStatus {
        match self {
            ConquestResult::Completed { .. } => JobStatus::Completed,
            _ => JobStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ConquestResult::Completed { .. })
    }

    /// Settlement reference, if any funds moved
    pub fn settlement_ref(&self) -> Option<&str> {
        match self {
            ConquestResult::Completed { settlement_ref, .. } => settlement_ref.as_deref(),
            ConquestResult::PaidButNotCommitted { settlement_ref, .. } => Some(settlement_ref),
            _ => None,
        }
    }
}

/// A job record. The sealed credential is kept out of this type.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub actor_id: ActorId,
    pub batch: ValidatedBatch,
    pub total_price: Decimal,
    pub result: Option<ConquestResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A job this worker moved to `processing`, with its opened credential
#[derive(Debug)]
pub struct ClaimedJob {
    pub job: Job,
    pub credential: FundingCredential,
}

/// Client-facing job status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub status: JobStatus,
    pub total_price: Decimal,
    pub cell_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ConquestResult>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let terminal = job.status.is_terminal();
        Self {
            retry_after: job.status.retry_after_secs(),
            cell_count: job.batch.cell_count(),
            result: job.result.filter(|_| terminal),
            id: job.id,
            status: job.status,
            total_price: job.total_price,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

pub struct JobQueue {
    db: Arc<ConquestDb>,
    sealer: CredentialSealer,
    retention: chrono::Duration,
}

impl JobQueue {
    pub fn new(db: Arc<ConquestDb>, sealer: CredentialSealer, retention: Duration) -> Self {
        Self {
            db,
            sealer,
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
        }
    }

    /// Persist a `pending` job and return its id without processing it
    pub async fn enqueue(
        &self,
        actor: &ActorId,
        batch: ValidatedBatch,
        credential: &FundingCredential,
    ) -> Result<String> {
        let now = Utc::now();
        let job = Job {
            id: format!("job_{}", Uuid::new_v4().simple()),
            status: JobStatus::Pending,
            actor_id: actor.clone(),
            total_price: batch.total_price,
            batch,
            result: None,
            created_at: now,
            updated_at: now,
        };
        let sealed = self.sealer.seal(credential)?;

        let (id, cells, total_price) = (job.id.clone(), job.batch.cell_count(), job.total_price);
        self.blocking(move |db| db.with_conn(|conn| job_rows::insert(conn, &job, &sealed)))
            .await?;
        info!(
            job_id = %id,
            actor = %actor,
            cells,
            total_price = %total_price,
            "Job enqueued"
        );
        Ok(id)
    }

    /// Client lookup; unknown and retention-expired jobs are both `JobNotFound`
    pub async fn get(&self, id: &str) -> Result<JobView> {
        let job = self
            .load(id)
            .await?
            .filter(|job| !self.is_expired(job))
            .ok_or_else(|| ConquestError::JobNotFound(id.to_string()))?;
        Ok(job.into())
    }

    async fn load(&self, id: &str) -> Result<Option<Job>> {
        let id = id.to_string();
        let row = self
            .blocking(move |db| db.with_conn(|conn| job_rows::get(conn, &id)))
            .await?;
        Ok(row.map(|(job, _)| job))
    }

    pub fn is_expired(&self, job: &Job) -> bool {
        job.created_at + self.retention < Utc::now()
    }

    /// Move a job forward. Anything but the legal next state is rejected.
    pub async fn transition(
        &self,
        id: &str,
        to: JobStatus,
        result: Option<ConquestResult>,
    ) -> Result<()> {
        let job_id = id.to_string();
        let from = self
            .blocking(move |db| {
                db.with_conn(|conn| {
                    let (job, _) = job_rows::get(conn, &job_id)?
                        .ok_or_else(|| ConquestError::JobNotFound(job_id.clone()))?;
                    let from = job.status;
                    if !from.can_transition_to(to) {
                        return Err(ConquestError::InvalidTransition {
                            job_id: job_id.clone(),
                            from,
                            to,
                        });
                    }

                    let changed =
                        job_rows::update_status(conn, &job_id, from, to, result.as_ref(), Utc::now())?;
                    if changed == 0 {
                        // Someone else moved it between our read and write
                        let current = job_rows::get(conn, &job_id)?
                            .map(|(job, _)| job.status)
                            .unwrap_or(from);
                        return Err(ConquestError::InvalidTransition {
                            job_id: job_id.clone(),
                            from: current,
                            to,
                        });
                    }
                    Ok(from)
                })
            })
            .await?;

        debug!(job_id = %id, %from, %to, "Job transitioned");
        Ok(())
    }

    /// Take ownership of a pending job. `None` if it already left `pending`.
    pub async fn claim(&self, id: &str) -> Result<Option<ClaimedJob>> {
        let job_id = id.to_string();
        let claimed = self
            .blocking(move |db| {
                db.with_conn(|conn| {
                    let changed = job_rows::update_status(
                        conn,
                        &job_id,
                        JobStatus::Pending,
                        JobStatus::Processing,
                        None,
                        Utc::now(),
                    )?;
                    if changed == 0 {
                        return Ok(None);
                    }
                    job_rows::get(conn, &job_id)?
                        .map(Some)
                        .ok_or_else(|| ConquestError::JobNotFound(job_id.clone()))
                })
            })
            .await?;

        let Some((job, sealed)) = claimed else {
            debug!(job_id = %id, "Job already claimed or missing, skipping");
            return Ok(None);
        };

        match self.sealer.open(&sealed) {
            Ok(credential) => Ok(Some(ClaimedJob { job, credential })),
            Err(e) => {
                warn!(job_id = %id, error = %e, "Cannot open job credential, failing job");
                self.transition(
                    id,
                    JobStatus::Failed,
                    Some(ConquestResult::Internal {
                        reason: "Stored credential could not be opened".into(),
                    }),
                )
                .await?;
                Err(e)
            }
        }
    }

    pub async fn oldest_pending(&self, limit: usize) -> Result<Vec<String>> {
        self.blocking(move |db| db.with_conn(|conn| job_rows::oldest_pending(conn, limit)))
            .await
    }

    /// Delete finished jobs created before `cutoff`
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let purged = self
            .blocking(move |db| db.with_conn(|conn| job_rows::purge_before(conn, cutoff)))
            .await?;
        if purged > 0 {
            info!(purged, "Purged finished jobs");
        }
        Ok(purged)
    }

    /// Run SQLite work off the async worker threads
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ConquestDb) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| ConquestError::Internal(format!("Job queue task failed: {e}")))?
    }
}
