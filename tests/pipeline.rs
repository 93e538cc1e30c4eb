//! End-to-end pipeline tests over an in-memory database

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Method, StatusCode};
use rust_decimal::Decimal;

use conquest::committer::ConquestCommitter;
use conquest::config::{GridConfig, LimitsConfig, SweeperConfig};
use conquest::credential::{CredentialSealer, FundingCredential};
use conquest::db::ConquestDb;
use conquest::http::HttpServer;
use conquest::payment::{FailureKind, PaymentGateway, PaymentOutcome, PaymentProtocol};
use conquest::rate_limit::RateLimiter;
use conquest::store::{BatchReport, CellStatus, CellStore, ConquerEntry, RecolorEntry, SqliteCellStore};
use conquest::validator::BatchValidator;
use conquest::{
    ActorId, Cell, CellRequest, Color, ConquestError, ConquestRequest, ConquestResult, ConquestService,
    Coord, GridBounds, JobQueue, JobStatus, Pipeline, SubmitOutcome,
};

/// Records every charge and settles or fails as scripted
#[derive(Default)]
struct ScriptedGateway {
    charges: Mutex<Vec<Decimal>>,
    fail_with: Option<FailureKind>,
}

impl ScriptedGateway {
    fn failing(kind: FailureKind) -> Self {
        Self {
            fail_with: Some(kind),
            ..Self::default()
        }
    }

    fn charges(&self) -> Vec<Decimal> {
        self.charges.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn protocol(&self) -> PaymentProtocol {
        PaymentProtocol::Simulated
    }

    async fn pay(&self, _credential: &FundingCredential, amount: Decimal) -> PaymentOutcome {
        let mut charges = self.charges.lock().unwrap();
        charges.push(amount);
        match self.fail_with {
            Some(kind) => PaymentOutcome::failed(kind, "Transaction rejected by wallet"),
            None => PaymentOutcome::settled(format!("tx-{}", charges.len())),
        }
    }
}

/// Reads work, the paid write always fails
struct BrokenWriteStore {
    inner: SqliteCellStore,
}

#[async_trait]
impl CellStore for BrokenWriteStore {
    async fn fetch_cells(&self, coords: &[Coord]) -> conquest::Result<Vec<Cell>> {
        self.inner.fetch_cells(coords).await
    }

    async fn get_cell(&self, coord: Coord) -> conquest::Result<Option<Cell>> {
        self.inner.get_cell(coord).await
    }

    async fn batch_conquer(
        &self,
        _entries: &[ConquerEntry],
        _actor: &ActorId,
        _settlement_ref: &str,
    ) -> conquest::Result<BatchReport> {
        Err(ConquestError::Internal("disk full".into()))
    }

    async fn recolor(&self, entries: &[RecolorEntry], actor: &ActorId) -> conquest::Result<BatchReport> {
        self.inner.recolor(entries, actor).await
    }
}

fn grid(async_threshold: usize) -> GridConfig {
    GridConfig {
        bounds: GridBounds {
            width: 10,
            height: 10,
        },
        max_batch: 100,
        async_threshold,
    }
}

fn pipeline_with(gateway: Arc<ScriptedGateway>, grid: GridConfig, sweeper: SweeperConfig) -> Pipeline {
    let db = Arc::new(ConquestDb::open_in_memory().unwrap());
    Pipeline::build(
        db,
        gateway,
        CredentialSealer::development(),
        grid,
        LimitsConfig::default(),
        sweeper,
    )
    .unwrap()
}

fn pipeline(gateway: Arc<ScriptedGateway>) -> Pipeline {
    pipeline_with(gateway, grid(20), SweeperConfig::default())
}

fn cells(coords: &[(i64, i64)], color: &str) -> Vec<CellRequest> {
    coords
        .iter()
        .map(|&(x, y)| CellRequest {
            x,
            y,
            color: color.to_string(),
        })
        .collect()
}

fn request(credential: &FundingCredential, cells: Vec<CellRequest>) -> ConquestRequest {
    ConquestRequest {
        credential: credential.clone(),
        cells,
        force_async: false,
    }
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn completed(outcome: SubmitOutcome) -> ConquestResult {
    match outcome {
        SubmitOutcome::Completed(receipt) => receipt.result,
        other => panic!("expected inline completion, got {other:?}"),
    }
}

async fn wait_for_terminal(service: &ConquestService, job_id: &str) -> JobStatus {
    for _ in 0..200 {
        let view = service.jobs().get(job_id).await.unwrap();
        if view.status.is_terminal() {
            return view.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never finished");
}

#[tokio::test]
async fn test_two_floor_cells_charge_floor_total_and_escalate() {
    let gateway = Arc::new(ScriptedGateway::default());
    let pipeline = pipeline(gateway.clone());
    let credential = FundingCredential::generate();

    let result = completed(
        pipeline
            .service
            .submit(request(&credential, cells(&[(0, 0), (1, 0)], "#FF0000")))
            .await
            .unwrap(),
    );

    assert_eq!(gateway.charges(), vec![dec("0.02")]);
    let ConquestResult::Completed { settlement_ref, report } = result else {
        panic!("expected completed result");
    };
    assert_eq!(settlement_ref.as_deref(), Some("tx-1"));
    assert_eq!(report.success_count, 2);
    assert_eq!(report.total_paid, dec("0.02"));

    for x in 0..2 {
        let cell = pipeline.service.get_cell(x, 0).await.unwrap();
        assert_eq!(cell.current_price, dec("0.012"));
        assert_eq!(cell.owner_id, Some(credential.actor_id()));
        assert_eq!(cell.color.as_str(), "#FF0000");
        assert_eq!(cell.conquest_count, 1);
    }
}

#[tokio::test]
async fn test_conquering_someone_elses_cell_pays_escalated_price() {
    let gateway = Arc::new(ScriptedGateway::default());
    let pipeline = pipeline(gateway.clone());
    let first = FundingCredential::generate();
    let second = FundingCredential::generate();

    pipeline
        .service
        .submit(request(&first, cells(&[(5, 5)], "#FF0000")))
        .await
        .unwrap();
    let result = completed(
        pipeline
            .service
            .submit(request(&second, cells(&[(5, 5)], "#00FF00")))
            .await
            .unwrap(),
    );

    assert!(result.is_success());
    assert_eq!(gateway.charges(), vec![dec("0.01"), dec("0.012")]);
    let cell = pipeline.service.get_cell(5, 5).await.unwrap();
    assert_eq!(cell.owner_id, Some(second.actor_id()));
    assert_eq!(cell.current_price, dec("0.0144"));
}

#[tokio::test]
async fn test_pure_recolor_makes_no_payment() {
    let gateway = Arc::new(ScriptedGateway::default());
    let pipeline = pipeline(gateway.clone());
    let credential = FundingCredential::generate();

    pipeline
        .service
        .submit(request(&credential, cells(&[(2, 3)], "#FF0000")))
        .await
        .unwrap();
    let result = completed(
        pipeline
            .service
            .submit(request(&credential, cells(&[(2, 3)], "#123456")))
            .await
            .unwrap(),
    );

    assert_eq!(gateway.charges().len(), 1);
    let ConquestResult::Completed { settlement_ref, report } = result else {
        panic!("expected completed result");
    };
    assert!(settlement_ref.is_none());
    assert_eq!(report.success_count, 1);
    assert_eq!(report.total_paid, Decimal::ZERO);

    let cell = pipeline.service.get_cell(2, 3).await.unwrap();
    assert_eq!(cell.color.as_str(), "#123456");
    assert_eq!(cell.current_price, dec("0.012"));
}

#[tokio::test]
async fn test_payment_failure_leaves_cells_untouched() {
    let gateway = Arc::new(ScriptedGateway::failing(FailureKind::Cancelled));
    let pipeline = pipeline(gateway.clone());
    let credential = FundingCredential::generate();

    let result = completed(
        pipeline
            .service
            .submit(request(&credential, cells(&[(4, 4)], "#FF0000")))
            .await
            .unwrap(),
    );

    let ConquestResult::PaymentFailed { failure } = result else {
        panic!("expected payment failure");
    };
    assert_eq!(failure.kind, FailureKind::Cancelled);

    let cell = pipeline.service.get_cell(4, 4).await.unwrap();
    assert!(cell.owner_id.is_none());
    assert_eq!(cell.current_price, dec("0.01"));
}

#[tokio::test]
async fn test_commit_failure_after_payment_reports_settlement_ref() {
    let db = Arc::new(ConquestDb::open_in_memory().unwrap());
    let sqlite = SqliteCellStore::new(Arc::clone(&db));
    sqlite.seed_grid(grid(20).bounds, conquest::pricing::FLOOR_PRICE).unwrap();
    let store = Arc::new(BrokenWriteStore { inner: sqlite });

    let gateway = Arc::new(ScriptedGateway::default());
    let jobs = Arc::new(JobQueue::new(
        Arc::clone(&db),
        CredentialSealer::development(),
        Duration::from_secs(3600),
    ));
    let service = Arc::new(ConquestService::new(
        store,
        gateway.clone(),
        jobs,
        Arc::new(RateLimiter::new()),
        grid(20),
        LimitsConfig::default(),
    ));
    let credential = FundingCredential::generate();

    let result = completed(
        service
            .submit(request(&credential, cells(&[(1, 1)], "#FF0000")))
            .await
            .unwrap(),
    );
    assert_eq!(gateway.charges(), vec![dec("0.01")]);
    match &result {
        ConquestResult::PaidButNotCommitted { settlement_ref, reason } => {
            assert_eq!(settlement_ref, "tx-1");
            assert!(reason.contains("disk full"));
        }
        other => panic!("expected paid-but-not-committed, got {other:?}"),
    }
    assert_eq!(result.settlement_ref(), Some("tx-1"));
    assert!(service.get_cell(1, 1).await.unwrap().owner_id.is_none());

    // Same failure over HTTP is a 500 that still carries the reference
    let server = HttpServer::new(service, db, 3, "127.0.0.1:0".parse().unwrap());
    let body = serde_json::json!({
        "credential": credential.to_base58(),
        "cells": [{ "x": 2, "y": 2, "color": "#00FF00" }],
    });
    let response = server
        .route(Method::POST, "/api/cells/conquer", Bytes::from(body.to_string()))
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = read_json(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["result"]["outcome"], "paid_but_not_committed");
    assert_eq!(json["result"]["settlementRef"], "tx-2");
}

#[tokio::test]
async fn test_partial_batch_reports_every_cell() {
    let db = Arc::new(ConquestDb::open_in_memory().unwrap());
    let store = Arc::new(SqliteCellStore::new(Arc::clone(&db)));
    store
        .seed_grid(GridBounds { width: 10, height: 10 }, conquest::pricing::FLOOR_PRICE)
        .unwrap();
    let actor = ActorId::new("actor-partial");
    let red = Color::parse("#FF0000").unwrap();
    let entry = |x, y| ConquerEntry {
        coord: Coord::new(x, y),
        color: red.clone(),
        quoted_price: dec("0.01"),
    };

    store
        .batch_conquer(&[entry(9, 9)], &actor, "earlier-ref")
        .await
        .unwrap();

    let committer = ConquestCommitter::new(store.clone());
    let outcome = committer
        .commit(
            &actor,
            &[entry(0, 0), entry(1, 0), entry(2, 0), entry(9, 9), entry(50, 50)],
            &[],
            Some("batch-ref"),
        )
        .await
        .unwrap();

    let ConquestResult::Completed { report, .. } = ConquestResult::from_commit(Some("batch-ref".into()), outcome)
    else {
        panic!("expected committed batch");
    };
    assert_eq!(report.success_count, 3);
    assert_eq!(report.skipped_count, 1);
    assert_eq!(report.error_count, 1);
    assert_eq!(report.results.len(), 5);
    assert_eq!(report.total_paid, dec("0.03"));
    assert_eq!(report.results[3].status, CellStatus::Skipped);
    assert_eq!(report.results[4].status, CellStatus::Error);
}

#[tokio::test]
async fn test_replayed_settlement_does_not_compound_price() {
    let db = Arc::new(ConquestDb::open_in_memory().unwrap());
    let store = SqliteCellStore::new(db);
    store
        .seed_grid(GridBounds { width: 2, height: 2 }, conquest::pricing::FLOOR_PRICE)
        .unwrap();
    let actor = ActorId::new("actor-replay");
    let entries = [ConquerEntry {
        coord: Coord::new(1, 1),
        color: Color::parse("#ABCDEF").unwrap(),
        quoted_price: dec("0.01"),
    }];

    let first = store.batch_conquer(&entries, &actor, "same-ref").await.unwrap();
    let second = store.batch_conquer(&entries, &actor, "same-ref").await.unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.success_count, second.success_count);
    let cell = store.get_cell(Coord::new(1, 1)).await.unwrap().unwrap();
    assert_eq!(cell.current_price, dec("0.012"));
    assert_eq!(cell.conquest_count, 1);
}

#[tokio::test]
async fn test_eleventh_conquest_in_a_minute_is_rate_limited() {
    let gateway = Arc::new(ScriptedGateway::default());
    let pipeline = pipeline(gateway.clone());
    let credential = FundingCredential::generate();

    for x in 0..10 {
        pipeline
            .service
            .submit(request(&credential, cells(&[(x, 7)], "#FF0000")))
            .await
            .unwrap();
    }
    let err = pipeline
        .service
        .submit(request(&credential, cells(&[(0, 8)], "#FF0000")))
        .await
        .unwrap_err();

    assert!(matches!(err, ConquestError::RateLimited { .. }));
    assert_eq!(gateway.charges().len(), 10);

    // Other actors have their own window
    let other = FundingCredential::generate();
    assert!(pipeline
        .service
        .submit(request(&other, cells(&[(0, 8)], "#FF0000")))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_large_batch_is_queued_and_finishes_in_background() {
    let gateway = Arc::new(ScriptedGateway::default());
    let pipeline = pipeline_with(gateway.clone(), grid(2), SweeperConfig::default());
    let credential = FundingCredential::generate();

    let outcome = pipeline
        .service
        .submit(request(&credential, cells(&[(0, 1), (1, 1), (2, 1)], "#FF0000")))
        .await
        .unwrap();
    let SubmitOutcome::Queued { job_id, total_price } = outcome else {
        panic!("expected a queued job");
    };
    assert!(job_id.starts_with("job_"));
    assert_eq!(total_price, dec("0.03"));

    assert_eq!(wait_for_terminal(&pipeline.service, &job_id).await, JobStatus::Completed);
    let view = pipeline.service.jobs().get(&job_id).await.unwrap();
    assert!(view.retry_after.is_none());
    assert!(matches!(view.result, Some(ConquestResult::Completed { .. })));
    assert_eq!(gateway.charges(), vec![dec("0.03")]);
}

#[tokio::test]
async fn test_forced_async_queues_small_batch() {
    let gateway = Arc::new(ScriptedGateway::default());
    let pipeline = pipeline(gateway);
    let credential = FundingCredential::generate();

    let mut req = request(&credential, cells(&[(3, 3)], "#FF0000"));
    req.force_async = true;
    let outcome = pipeline.service.submit(req).await.unwrap();
    let SubmitOutcome::Queued { job_id, .. } = outcome else {
        panic!("expected a queued job");
    };
    assert_eq!(wait_for_terminal(&pipeline.service, &job_id).await, JobStatus::Completed);
}

#[tokio::test]
async fn test_sweeper_resolves_job_left_pending_by_a_crash() {
    let gateway = Arc::new(ScriptedGateway::default());
    let pipeline = pipeline(gateway.clone());
    let credential = FundingCredential::generate();
    let actor = credential.actor_id();

    // Enqueued but never driven, as if the process died right after
    let validator = BatchValidator::new(pipeline.store.clone(), grid(20).bounds, 100);
    let batch = validator
        .validate(&actor, &cells(&[(6, 6), (7, 6)], "#00FF00"))
        .await
        .unwrap();
    let job_id = pipeline.service.jobs().enqueue(&actor, batch, &credential).await.unwrap();
    assert_eq!(pipeline.service.jobs().get(&job_id).await.unwrap().status, JobStatus::Pending);

    let sweeper = pipeline.sweeper();
    let report = sweeper.tick().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.completed, 1);

    assert_eq!(pipeline.service.jobs().get(&job_id).await.unwrap().status, JobStatus::Completed);
    assert_eq!(gateway.charges(), vec![dec("0.02")]);
    let cell = pipeline.service.get_cell(6, 6).await.unwrap();
    assert_eq!(cell.owner_id, Some(actor));

    // Nothing left; a second tick is a no-op
    let report = sweeper.tick().await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(gateway.charges().len(), 1);
}

#[tokio::test]
async fn test_unrecordable_job_result_reports_settlement_ref() {
    let gateway = Arc::new(ScriptedGateway::default());
    let pipeline = pipeline(gateway.clone());
    let credential = FundingCredential::generate();
    let actor = credential.actor_id();

    let validator = BatchValidator::new(pipeline.store.clone(), grid(20).bounds, 100);
    let batch = validator
        .validate(&actor, &cells(&[(5, 5)], "#0000FF"))
        .await
        .unwrap();
    let job_id = pipeline.service.jobs().enqueue(&actor, batch, &credential).await.unwrap();

    // Claiming works, every terminal write fails
    pipeline
        .db
        .with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER jobs_terminal_write_fails BEFORE UPDATE OF status ON jobs
                 WHEN NEW.status IN ('completed', 'failed')
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )?;
            Ok(())
        })
        .unwrap();

    let err = pipeline.service.run_job(&job_id).await.unwrap_err();
    assert!(err.to_string().contains("tx-1"), "{err}");
    assert_eq!(gateway.charges(), vec![dec("0.01")]);

    // Cells were committed; only the job record is stuck
    let cell = pipeline.service.get_cell(5, 5).await.unwrap();
    assert_eq!(cell.owner_id, Some(actor));
    assert_eq!(pipeline.service.jobs().get(&job_id).await.unwrap().status, JobStatus::Processing);
}

#[tokio::test]
async fn test_stale_pending_job_expires_without_payment() {
    let gateway = Arc::new(ScriptedGateway::default());
    let sweeper_config = SweeperConfig {
        job_retention: Duration::from_millis(1),
        ..SweeperConfig::default()
    };
    let pipeline = pipeline_with(gateway.clone(), grid(20), sweeper_config);
    let credential = FundingCredential::generate();
    let actor = credential.actor_id();

    let validator = BatchValidator::new(pipeline.store.clone(), grid(20).bounds, 100);
    let batch = validator
        .validate(&actor, &cells(&[(8, 8)], "#00FF00"))
        .await
        .unwrap();
    pipeline.service.jobs().enqueue(&actor, batch, &credential).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = pipeline.sweeper().tick().await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(gateway.charges().is_empty());
    assert!(pipeline.service.get_cell(8, 8).await.unwrap().owner_id.is_none());
}

#[tokio::test]
async fn test_validation_rejects_before_payment() {
    let gateway = Arc::new(ScriptedGateway::default());
    let pipeline = pipeline(gateway.clone());
    let credential = FundingCredential::generate();

    let err = pipeline
        .service
        .submit(request(&credential, cells(&[(10, 0)], "#FF0000")))
        .await
        .unwrap_err();
    assert!(matches!(err, ConquestError::InvalidCell { .. }));

    let err = pipeline
        .service
        .submit(request(&credential, cells(&[(0, 0), (0, 0)], "#FF0000")))
        .await
        .unwrap_err();
    assert!(matches!(err, ConquestError::InvalidCell { .. }));

    let err = pipeline
        .service
        .submit(request(&credential, vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, ConquestError::InvalidInput(_)));

    assert!(gateway.charges().is_empty());
}

async fn read_json(response: hyper::Response<http_body_util::Full<Bytes>>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_http_routes() {
    let gateway = Arc::new(ScriptedGateway::default());
    let pipeline = pipeline(gateway);
    let server = HttpServer::new(
        Arc::clone(&pipeline.service),
        Arc::clone(&pipeline.db),
        3,
        "127.0.0.1:0".parse().unwrap(),
    );
    let credential = FundingCredential::generate();

    let health = server.route(Method::GET, "/health", Bytes::new()).await;
    assert_eq!(health.status(), StatusCode::OK);
    let json = read_json(health).await;
    assert_eq!(json["stats"]["cells"], 100);
    assert_eq!(json["stats"]["totalValue"], "1.00");

    let body = serde_json::json!({
        "credential": credential.to_base58(),
        "cells": [{ "x": 0, "y": 0, "color": "#FF0000" }],
    });
    let response = server
        .route(Method::POST, "/api/cells/conquer", Bytes::from(body.to_string()))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["result"]["outcome"], "completed");
    assert_eq!(json["result"]["report"]["successCount"], 1);

    let response = server.route(Method::GET, "/api/cells/0/0", Bytes::new()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(json["cell"]["ownerId"], credential.actor_id().as_str());

    let body = serde_json::json!({
        "credential": credential.to_base58(),
        "cells": [
            { "x": 0, "y": 0, "color": "#00FF00" },
            { "x": 1, "y": 1, "color": "#00FF00" },
        ],
    });
    let response = server
        .route(Method::POST, "/api/cells/recolor", Bytes::from(body.to_string()))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(json["result"]["report"]["successCount"], 1);
    assert_eq!(json["result"]["report"]["skippedCount"], 1);
    let cell = pipeline.service.get_cell(0, 0).await.unwrap();
    assert_eq!(cell.color.as_str(), "#00FF00");
    assert!(pipeline.service.get_cell(1, 1).await.unwrap().owner_id.is_none());

    let response = server.route(Method::GET, "/api/cells/0/100", Bytes::new()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = server.route(Method::GET, "/api/jobs/job_missing", Bytes::new()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = server
        .route(Method::POST, "/api/cells/conquer", Bytes::from_static(b"{not json"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = server.route(Method::POST, "/api/cron/sweep", Bytes::new()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = server.route(Method::DELETE, "/api/cells/0/0", Bytes::new()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
