//! Job sweeper
//!
//! The recurring worker. Each tick picks the oldest few `pending` jobs and
//! runs them one after another; a job that another invocation claimed in the
//! meantime is skipped. Running it more often than needed is harmless.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::JobStatus;
use crate::error::Result;
use crate::service::ConquestService;

/// Jobs drained per tick
pub const DEFAULT_SWEEP_BATCH: usize = 3;

/// Tick period of the in-process loop
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct Sweeper {
    service: Arc<ConquestService>,
    batch_size: usize,
}

impl Sweeper {
    pub fn new(service: Arc<ConquestService>, batch_size: usize) -> Self {
        Self {
            service,
            batch_size: batch_size.max(1),
        }
    }

    /// Drain up to `batch_size` pending jobs, strictly one at a time
    pub async fn tick(&self) -> Result<SweepReport> {
        let ids = self.service.jobs().oldest_pending(self.batch_size).await?;
        let mut report = SweepReport {
            examined: ids.len(),
            ..SweepReport::default()
        };

        if ids.is_empty() {
            debug!("No pending jobs");
            return Ok(report);
        }

        for id in ids {
            match self.service.run_job(&id).await {
                Ok(Some(JobStatus::Completed)) => report.completed += 1,
                Ok(Some(_)) => report.failed += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    error!(job_id = %id, error = %e, "Sweeper could not run job");
                    report.errors += 1;
                }
            }
        }

        info!(
            examined = report.examined,
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            errors = report.errors,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Run [`Sweeper::tick`] every `interval` until the task is aborted
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.tick().await {
                    error!(error = %e, "Sweep tick failed");
                }
            }
        })
    }
}
