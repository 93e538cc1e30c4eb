//! HTTP API for the conquest pipeline
//!
//! - `GET /health` - Liveness and database counters
//! - `POST /api/cells/conquer` - Conquer cells (inline, or queued as a job)
//! - `POST /api/cells/recolor` - Free recolor of owned cells
//! - `POST /api/cells/quote` - Price preview
//! - `GET /api/cells/{x}/{y}` - One cell
//! - `GET /api/jobs/{id}` - Job status poll
//! - `POST /api/cron/sweep` - Run one sweeper tick (external scheduler hook)
//!
//! ```bash
//! curl -X POST http://localhost:8090/api/cells/conquer \
//!      -H "Content-Type: application/json" \
//!      -d '{"credential":"<base58 keypair>","cells":[{"x":3,"y":7,"color":"#FF0000"}]}'
//! ```

pub mod response;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::credential::FundingCredential;
use crate::db::ConquestDb;
use crate::error::{ConquestError, Result};
use crate::grid::{ActorId, CellRequest};
use crate::jobs::{ConquestResult, JobStatus, Sweeper};
use crate::service::{ConquestReceipt, ConquestRequest, ConquestService, SubmitOutcome};

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 256 * 1024;

#[derive(Debug, Deserialize)]
struct ConquerBody {
    credential: String,
    cells: Vec<CellRequest>,
    #[serde(default, rename = "async")]
    force_async: bool,
}

#[derive(Debug, Deserialize)]
struct RecolorBody {
    credential: String,
    cells: Vec<CellRequest>,
}

#[derive(Debug, Deserialize)]
struct QuoteBody {
    #[serde(default)]
    actor: Option<String>,
    cells: Vec<CellRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuedBody<'a> {
    job_id: &'a str,
    status: JobStatus,
    total_price: rust_decimal::Decimal,
    poll_url: String,
    retry_after: Option<u64>,
}

/// HTTP server state
pub struct HttpServer {
    service: Arc<ConquestService>,
    db: Arc<ConquestDb>,
    sweep_batch: usize,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(
        service: Arc<ConquestService>,
        db: Arc<ConquestDb>,
        sweep_batch: usize,
        bind_addr: SocketAddr,
    ) -> Self {
        Self {
            service,
            db,
            sweep_batch,
            bind_addr,
        }
    }

    /// Accept connections until the task is dropped
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(error = %e, "Rejected request body");
                return Ok(response::payload_too_large("Request body too large or unreadable"));
            }
        };

        Ok(self.route(method, &path, body).await)
    }

    /// Dispatch a request that has already been read into memory
    pub async fn route(&self, method: Method, path: &str, body: Bytes) -> Response<Full<Bytes>> {
        debug!(method = %method, path = %path, "Incoming request");

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let result = match (method, segments.as_slice()) {
            (Method::GET, ["health"]) => self.handle_health(),
            (Method::POST, ["api", "cells", "conquer"]) => self.handle_conquer(&body).await,
            (Method::POST, ["api", "cells", "recolor"]) => self.handle_recolor(&body).await,
            (Method::POST, ["api", "cells", "quote"]) => self.handle_quote(&body).await,
            (Method::GET, ["api", "cells", x, y]) => self.handle_get_cell(x, y).await,
            (Method::GET, ["api", "jobs", id]) => self.handle_get_job(id).await,
            (Method::POST, ["api", "cron", "sweep"]) => self.handle_sweep().await,
            _ => return response::not_found("Not Found"),
        };

        result.unwrap_or_else(|e| response::error_response(&e))
    }

    fn handle_health(&self) -> Result<Response<Full<Bytes>>> {
        let stats = self.db.stats()?;
        let grid = self.service.grid();
        Ok(response::ok(&serde_json::json!({
            "status": "ok",
            "grid": { "width": grid.bounds.width, "height": grid.bounds.height },
            "maxBatch": grid.max_batch,
            "stats": stats,
            "rateLimitedKeys": self.service.limiter().tracked(),
        })))
    }

    /// POST /api/cells/conquer
    async fn handle_conquer(&self, body: &[u8]) -> Result<Response<Full<Bytes>>> {
        let body: ConquerBody = serde_json::from_slice(body)?;
        let request = ConquestRequest {
            credential: FundingCredential::from_base58(&body.credential)?,
            cells: body.cells,
            force_async: body.force_async,
        };

        match self.service.submit(request).await? {
            SubmitOutcome::Completed(receipt) => Ok(receipt_response(&receipt)),
            SubmitOutcome::Queued {
                job_id,
                total_price,
            } => Ok(response::accepted(&QueuedBody {
                poll_url: format!("/api/jobs/{job_id}"),
                job_id: &job_id,
                status: JobStatus::Pending,
                total_price,
                retry_after: JobStatus::Pending.retry_after_secs(),
            })),
        }
    }

    /// POST /api/cells/recolor
    async fn handle_recolor(&self, body: &[u8]) -> Result<Response<Full<Bytes>>> {
        let body: RecolorBody = serde_json::from_slice(body)?;
        let credential = FundingCredential::from_base58(&body.credential)?;
        let receipt = self.service.recolor(&credential, &body.cells).await?;
        Ok(receipt_response(&receipt))
    }

    /// POST /api/cells/quote
    async fn handle_quote(&self, body: &[u8]) -> Result<Response<Full<Bytes>>> {
        let body: QuoteBody = serde_json::from_slice(body)?;
        let actor = body.actor.map(ActorId::new);
        let quote = self.service.quote(actor.as_ref(), &body.cells).await?;
        Ok(response::ok(&quote))
    }

    /// GET /api/cells/{x}/{y}
    async fn handle_get_cell(&self, x: &str, y: &str) -> Result<Response<Full<Bytes>>> {
        let parse = |v: &str| {
            v.parse::<i64>()
                .map_err(|_| ConquestError::InvalidInput(format!("Invalid coordinate: {v}")))
        };
        let cell = self.service.get_cell(parse(x)?, parse(y)?).await?;
        Ok(response::ok(&serde_json::json!({
            "cell": cell,
            "nextPrice": crate::pricing::next_price(cell.current_price),
            "displayPrice": crate::pricing::format_amount(cell.current_price),
        })))
    }

    /// GET /api/jobs/{id}
    async fn handle_get_job(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        let view = self.service.poll_job(id).await?;
        Ok(response::ok(&view))
    }

    /// POST /api/cron/sweep
    async fn handle_sweep(&self) -> Result<Response<Full<Bytes>>> {
        self.service.admit_sweep()?;
        let report = Sweeper::new(Arc::clone(&self.service), self.sweep_batch)
            .tick()
            .await?;
        Ok(response::ok(&serde_json::json!({ "report": report })))
    }
}

/// Status follows the result: payment failures are the client's to act on,
/// anything that happened after payment is ours.
fn receipt_response(receipt: &ConquestReceipt) -> Response<Full<Bytes>> {
    let status = match &receipt.result {
        ConquestResult::Completed { .. } => StatusCode::OK,
        ConquestResult::PaymentFailed { .. } => StatusCode::BAD_REQUEST,
        ConquestResult::PaidButNotCommitted { .. }
        | ConquestResult::Expired { .. }
        | ConquestResult::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    response::envelope(status, receipt.result.is_success(), receipt)
}
