//! Batch validation
//!
//! Turns a client's raw cell list into a [`ValidatedBatch`]: input checks
//! first (size, bounds, color, duplicates), then a single batched read of the
//! authoritative cells, then a partition into paid conquests and free recolors.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConquestError, Result};
use crate::grid::{ActorId, Cell, CellRequest, Color, Coord, GridBounds};
use crate::pricing::next_price;
use crate::store::{CellStore, ConquerEntry, RecolorEntry};

/// Largest batch accepted in one request
pub const DEFAULT_MAX_BATCH: usize = 100;

/// A batch that passed validation, ready for payment and commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedBatch {
    pub to_conquer: Vec<ConquerEntry>,
    pub to_recolor: Vec<RecolorEntry>,
    /// Sum of quoted prices of `to_conquer`
    pub total_price: Decimal,
}

impl ValidatedBatch {
    /// Every cell is already owned by the actor; nothing to pay
    pub fn is_free(&self) -> bool {
        self.to_conquer.is_empty()
    }

    pub fn cell_count(&self) -> usize {
        self.to_conquer.len() + self.to_recolor.len()
    }
}

/// Read-only price preview for one cell
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotedCell {
    pub x: u32,
    pub y: u32,
    pub price: Decimal,
    pub next_price: Decimal,
    pub owned: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub total_price: Decimal,
    pub cells: Vec<QuotedCell>,
}

pub struct BatchValidator {
    store: Arc<dyn CellStore>,
    bounds: GridBounds,
    max_batch: usize,
}

impl BatchValidator {
    pub fn new(store: Arc<dyn CellStore>, bounds: GridBounds, max_batch: usize) -> Self {
        Self {
            store,
            bounds,
            max_batch,
        }
    }

    pub fn bounds(&self) -> GridBounds {
        self.bounds
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// Input checks that need no store access
    pub fn check_requests(&self, requests: &[CellRequest]) -> Result<Vec<(Coord, Color)>> {
        if requests.is_empty() {
            return Err(ConquestError::InvalidInput(
                "At least one cell is required".into(),
            ));
        }
        if requests.len() > self.max_batch {
            return Err(ConquestError::TooManyCells {
                requested: requests.len(),
                max: self.max_batch,
            });
        }

        let mut seen = HashSet::with_capacity(requests.len());
        requests
            .iter()
            .map(|req| {
                let coord = self.bounds.coord(req.x, req.y)?;
                let color = Color::parse(&req.color).map_err(|_| ConquestError::InvalidCell {
                    x: req.x,
                    y: req.y,
                    reason: format!("invalid color {:?}, expected #RRGGBB", req.color),
                })?;
                if !seen.insert(coord) {
                    return Err(ConquestError::InvalidCell {
                        x: req.x,
                        y: req.y,
                        reason: "duplicate coordinate in batch".into(),
                    });
                }
                Ok((coord, color))
            })
            .collect()
    }

    /// Validate a batch on behalf of `actor`
    pub async fn validate(&self, actor: &ActorId, requests: &[CellRequest]) -> Result<ValidatedBatch> {
        let checked = self.check_requests(requests)?;
        let cells = self.load(&checked).await?;

        let mut to_conquer = Vec::new();
        let mut to_recolor = Vec::new();
        for (coord, color) in checked {
            let cell = &cells[&coord];
            if cell.is_owned_by(actor) {
                to_recolor.push(RecolorEntry { coord, color });
            } else {
                to_conquer.push(ConquerEntry {
                    coord,
                    color,
                    quoted_price: cell.current_price,
                });
            }
        }

        let total_price = to_conquer.iter().map(|e| e.quoted_price).sum();
        debug!(
            actor = %actor,
            conquer = to_conquer.len(),
            recolor = to_recolor.len(),
            %total_price,
            "Batch validated"
        );

        Ok(ValidatedBatch {
            to_conquer,
            to_recolor,
            total_price,
        })
    }

    /// Price preview; cells owned by `actor` (if given) cost nothing
    pub async fn quote(&self, actor: Option<&ActorId>, requests: &[CellRequest]) -> Result<Quote> {
        let checked = self.check_requests(requests)?;
        let cells = self.load(&checked).await?;

        let quoted: Vec<QuotedCell> = checked
            .iter()
            .map(|(coord, _)| {
                let cell = &cells[coord];
                QuotedCell {
                    x: coord.x,
                    y: coord.y,
                    price: cell.current_price,
                    next_price: next_price(cell.current_price),
                    owned: actor.is_some_and(|a| cell.is_owned_by(a)),
                }
            })
            .collect();

        let total_price = quoted.iter().filter(|c| !c.owned).map(|c| c.price).sum();
        Ok(Quote {
            total_price,
            cells: quoted,
        })
    }

    /// One batched read; any missing coordinate fails the whole batch
    async fn load(&self, checked: &[(Coord, Color)]) -> Result<HashMap<Coord, Cell>> {
        let coords: Vec<Coord> = checked.iter().map(|(c, _)| *c).collect();
        let cells: HashMap<Coord, Cell> = self
            .store
            .fetch_cells(&coords)
            .await?
            .into_iter()
            .map(|cell| (cell.coord, cell))
            .collect();

        if let Some(missing) = coords.iter().find(|c| !cells.contains_key(c)) {
            return Err(ConquestError::CellNotFound {
                x: missing.x,
                y: missing.y,
            });
        }
        Ok(cells)
    }
}
