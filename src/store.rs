//! Store boundary
//!
//! The store is the authority on final price and ownership. The pipeline only
//! reaches it through [`CellStore`]: one batched read and one atomic batch
//! write per settlement reference. [`SqliteCellStore`] is the local
//! implementation backed by [`ConquestDb`].

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::{cells, ConquestDb};
use crate::error::{ConquestError, Result};
use crate::grid::{ActorId, Cell, Color, Coord, GridBounds};

/// A cell to transfer to the paying actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConquerEntry {
    pub coord: Coord,
    pub color: Color,
    /// Price observed at validation time; the store charges its own current price
    pub quoted_price: Decimal,
}

/// A free color change on a cell the actor already owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecolorEntry {
    pub coord: Coord,
    pub color: Color,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellStatus {
    Success,
    Skipped,
    Error,
}

/// Per-cell outcome of a batch write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellResult {
    pub x: u32,
    pub y: u32,
    pub status: CellStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_paid: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CellResult {
    pub fn conquered(coord: Coord, quoted: Decimal, paid: Decimal, new_price: Decimal) -> Self {
        Self {
            x: coord.x,
            y: coord.y,
            status: CellStatus::Success,
            quoted_price: Some(quoted),
            price_paid: Some(paid),
            new_price: Some(new_price),
            message: None,
        }
    }

    pub fn recolored(coord: Coord) -> Self {
        Self {
            x: coord.x,
            y: coord.y,
            status: CellStatus::Success,
            quoted_price: None,
            price_paid: None,
            new_price: None,
            message: None,
        }
    }

    pub fn skipped(coord: Coord, message: impl Into<String>) -> Self {
        Self {
            status: CellStatus::Skipped,
            message: Some(message.into()),
            ..Self::recolored(coord)
        }
    }

    pub fn error(coord: Coord, message: impl Into<String>) -> Self {
        Self {
            status: CellStatus::Error,
            message: Some(message.into()),
            ..Self::recolored(coord)
        }
    }
}

/// Aggregate result of one atomic batch write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub success_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
    pub total_paid: Decimal,
    pub results: Vec<CellResult>,
    /// True when the store returned a previously applied result for the same settlement
    #[serde(default)]
    pub replayed: bool,
}

impl BatchReport {
    pub fn from_results(results: Vec<CellResult>) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count();
        let total_paid = results.iter().filter_map(|r| r.price_paid).sum();
        Self {
            success_count: count(CellStatus::Success),
            skipped_count: count(CellStatus::Skipped),
            error_count: count(CellStatus::Error),
            total_paid,
            results,
            replayed: false,
        }
    }

    pub fn empty() -> Self {
        Self::from_results(Vec::new())
    }

    /// Fold a second report (e.g. recolors after conquests) into this one
    pub fn merge(mut self, other: BatchReport) -> Self {
        self.success_count += other.success_count;
        self.skipped_count += other.skipped_count;
        self.error_count += other.error_count;
        self.total_paid += other.total_paid;
        self.results.extend(other.results);
        self.replayed |= other.replayed;
        self
    }

    pub fn total_cells(&self) -> usize {
        self.results.len()
    }
}

/// Authoritative cell state and the atomic batch operations on it
#[async_trait]
pub trait CellStore: Send + Sync {
    /// One batched read; coordinates absent from the store are simply missing from the result
    async fn fetch_cells(&self, coords: &[Coord]) -> Result<Vec<Cell>>;

    async fn get_cell(&self, coord: Coord) -> Result<Option<Cell>>;

    /// Atomically transfer `entries` to `actor`. Idempotent per `settlement_ref`.
    async fn batch_conquer(
        &self,
        entries: &[ConquerEntry],
        actor: &ActorId,
        settlement_ref: &str,
    ) -> Result<BatchReport>;

    /// Change colors of cells the actor owns; last write wins
    async fn recolor(&self, entries: &[RecolorEntry], actor: &ActorId) -> Result<BatchReport>;
}

/// [`CellStore`] over the local SQLite database
pub struct SqliteCellStore {
    db: Arc<ConquestDb>,
}

impl SqliteCellStore {
    pub fn new(db: Arc<ConquestDb>) -> Self {
        Self { db }
    }

    /// Create every missing cell at the floor price; existing cells are untouched
    pub fn seed_grid(&self, bounds: GridBounds, floor_price: Decimal) -> Result<usize> {
        self.db
            .with_conn_mut(|conn| cells::seed_grid(conn, bounds, floor_price))
    }

    /// Conquest ledger rows for one cell, newest first
    pub fn history(&self, coord: Coord, limit: u32) -> Result<Vec<cells::ConquestRow>> {
        self.db.with_conn(|conn| cells::conquest_history(conn, coord, limit))
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ConquestDb) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| ConquestError::Internal(format!("Store task failed: {e}")))?
    }
}

#[async_trait]
impl CellStore for SqliteCellStore {
    async fn fetch_cells(&self, coords: &[Coord]) -> Result<Vec<Cell>> {
        let coords = coords.to_vec();
        self.blocking(move |db| db.with_conn(|conn| cells::fetch_cells(conn, &coords)))
            .await
    }

    async fn get_cell(&self, coord: Coord) -> Result<Option<Cell>> {
        self.blocking(move |db| db.with_conn(|conn| cells::get_cell(conn, coord)))
            .await
    }

    async fn batch_conquer(
        &self,
        entries: &[ConquerEntry],
        actor: &ActorId,
        settlement_ref: &str,
    ) -> Result<BatchReport> {
        let entries = entries.to_vec();
        let actor = actor.clone();
        let settlement_ref = settlement_ref.to_string();
        self.blocking(move |db| {
            db.with_conn_mut(|conn| cells::batch_conquer(conn, &entries, &actor, &settlement_ref))
        })
        .await
    }

    async fn recolor(&self, entries: &[RecolorEntry], actor: &ActorId) -> Result<BatchReport> {
        let entries = entries.to_vec();
        let actor = actor.clone();
        self.blocking(move |db| db.with_conn_mut(|conn| cells::recolor(conn, &entries, &actor)))
            .await
    }
}
