//! Pipeline assembly
//!
//! Builds the store, job queue and service over one database. Shared by the
//! server, the standalone sweeper and the integration tests.

use std::sync::Arc;

use tracing::info;

use crate::config::{CoreArgs, GridConfig, LimitsConfig, SweeperConfig};
use crate::credential::CredentialSealer;
use crate::db::ConquestDb;
use crate::error::Result;
use crate::jobs::{JobQueue, Sweeper};
use crate::payment::{build_gateway, PaymentGateway};
use crate::pricing::FLOOR_PRICE;
use crate::rate_limit::RateLimiter;
use crate::service::ConquestService;
use crate::store::SqliteCellStore;

pub struct Pipeline {
    pub db: Arc<ConquestDb>,
    pub store: Arc<SqliteCellStore>,
    pub service: Arc<ConquestService>,
    pub sweeper_config: SweeperConfig,
}

impl Pipeline {
    /// Assemble over an open database and seed any missing grid cells
    pub fn build(
        db: Arc<ConquestDb>,
        gateway: Arc<dyn PaymentGateway>,
        sealer: CredentialSealer,
        grid: GridConfig,
        limits: LimitsConfig,
        sweeper_config: SweeperConfig,
    ) -> Result<Self> {
        let store = Arc::new(SqliteCellStore::new(Arc::clone(&db)));
        store.seed_grid(grid.bounds, FLOOR_PRICE)?;

        let jobs = Arc::new(JobQueue::new(
            Arc::clone(&db),
            sealer,
            sweeper_config.job_retention,
        ));
        let service = Arc::new(ConquestService::new(
            store.clone(),
            gateway,
            jobs,
            Arc::new(RateLimiter::new()),
            grid,
            limits,
        ));

        Ok(Self {
            db,
            store,
            service,
            sweeper_config,
        })
    }

    /// Open the configured database and gateway
    pub fn from_config(core: &CoreArgs, limits: LimitsConfig, sweeper_config: SweeperConfig) -> Result<Self> {
        let db = Arc::new(ConquestDb::open(&core.db_path)?);
        let gateway = build_gateway(&core.payment())?;
        let pipeline = Self::build(db, gateway, core.sealer()?, core.grid(), limits, sweeper_config)?;
        info!(
            db = %core.db_path.display(),
            width = core.grid_width,
            height = core.grid_height,
            "Pipeline ready"
        );
        Ok(pipeline)
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(Arc::clone(&self.service), self.sweeper_config.batch_size)
    }
}
