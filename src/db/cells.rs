//! Cell queries and the atomic batch conquest

use std::str::FromStr;

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ConquestError, Result};
use crate::grid::{ActorId, Cell, Color, Coord, GridBounds, DEFAULT_CELL_COLOR};
use crate::pricing::next_price;
use crate::store::{BatchReport, CellResult, ConquerEntry, RecolorEntry};

const CELL_COLUMNS: &str =
    "x, y, color, current_price, owner_id, conquest_count, last_settlement_ref";

/// One committed conquest from the ledger
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConquestRow {
    pub settlement_ref: String,
    pub from_owner: Option<String>,
    pub to_owner: String,
    pub price_paid: String,
    pub new_price: String,
    pub color: String,
    pub conquered_at: String,
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn cell_from_row(row: &Row) -> rusqlite::Result<Cell> {
    let color: String = row.get(2)?;
    let price: String = row.get(3)?;
    let owner: Option<String> = row.get(4)?;
    let count: i64 = row.get(5)?;

    Ok(Cell {
        coord: Coord::new(row.get(0)?, row.get(1)?),
        color: Color::parse(&color).map_err(|e| conversion_error(2, e))?,
        current_price: Decimal::from_str(&price).map_err(|e| conversion_error(3, e))?,
        owner_id: owner.map(ActorId::new),
        conquest_count: count.max(0) as u64,
        last_settlement_ref: row.get(6)?,
    })
}

fn parse_price(text: &str) -> Result<Decimal> {
    Decimal::from_str(text)
        .map_err(|e| ConquestError::Internal(format!("Corrupt stored price {text:?}: {e}")))
}

/// Insert every cell in `bounds` that doesn't exist yet
pub fn seed_grid(conn: &mut Connection, bounds: GridBounds, floor_price: Decimal) -> Result<usize> {
    let tx = conn.transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO cells (x, y, color, current_price, conquest_count)
             VALUES (?1, ?2, ?3, ?4, 0)",
        )?;
        let price = floor_price.to_string();
        for x in 0..bounds.width {
            for y in 0..bounds.height {
                inserted += stmt.execute(params![x, y, DEFAULT_CELL_COLOR, price])?;
            }
        }
    }
    tx.commit()?;

    if inserted > 0 {
        info!(inserted, width = bounds.width, height = bounds.height, "Seeded grid cells");
    }
    Ok(inserted)
}

pub fn get_cell(conn: &Connection, coord: Coord) -> Result<Option<Cell>> {
    let sql = format!("SELECT {CELL_COLUMNS} FROM cells WHERE x = ?1 AND y = ?2");
    Ok(conn
        .query_row(&sql, params![coord.x, coord.y], cell_from_row)
        .optional()?)
}

/// Fetch many cells in one statement. Missing coordinates are absent from the result.
pub fn fetch_cells(conn: &Connection, coords: &[Coord]) -> Result<Vec<Cell>> {
    if coords.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["(?, ?)"; coords.len()].join(", ");
    let sql = format!(
        "SELECT {CELL_COLUMNS} FROM cells WHERE (x, y) IN (VALUES {placeholders})"
    );
    let values = coords.iter().flat_map(|c| [c.x, c.y]);

    let mut stmt = conn.prepare(&sql)?;
    let cells = stmt
        .query_map(params_from_iter(values), cell_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(cells)
}

/// Apply a paid batch in one transaction.
///
/// A settlement reference already in `settlements` returns the stored report
/// unchanged, so a retried commit can never escalate a price twice.
pub fn batch_conquer(
    conn: &mut Connection,
    entries: &[ConquerEntry],
    actor: &ActorId,
    settlement_ref: &str,
) -> Result<BatchReport> {
    let tx = conn.transaction()?;

    let applied: Option<String> = tx
        .query_row(
            "SELECT report_json FROM settlements WHERE settlement_ref = ?1",
            [settlement_ref],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(json) = applied {
        debug!(settlement_ref, "Settlement already applied, replaying report");
        let mut report: BatchReport = serde_json::from_str(&json)?;
        report.replayed = true;
        return Ok(report);
    }

    let now = Utc::now().to_rfc3339();
    let mut results = Vec::with_capacity(entries.len());

    for entry in entries {
        let coord = entry.coord;
        let current: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT current_price, owner_id FROM cells WHERE x = ?1 AND y = ?2",
                params![coord.x, coord.y],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((price_text, previous_owner)) = current else {
            results.push(CellResult::error(coord, "Cell not found"));
            continue;
        };

        if previous_owner.as_deref() == Some(actor.as_str()) {
            results.push(CellResult::skipped(coord, "Already owned by actor"));
            continue;
        }

        let price_paid = parse_price(&price_text)?;
        let new_price = next_price(price_paid);

        tx.execute(
            "UPDATE cells SET owner_id = ?1, current_price = ?2, color = ?3,
                 conquest_count = conquest_count + 1, last_settlement_ref = ?4,
                 last_conquered_at = ?5
             WHERE x = ?6 AND y = ?7",
            params![
                actor.as_str(),
                new_price.to_string(),
                entry.color.as_str(),
                settlement_ref,
                now,
                coord.x,
                coord.y
            ],
        )?;
        tx.execute(
            "INSERT INTO conquests
                 (x, y, settlement_ref, from_owner, to_owner, price_paid, new_price, color, conquered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                coord.x,
                coord.y,
                settlement_ref,
                previous_owner,
                actor.as_str(),
                price_paid.to_string(),
                new_price.to_string(),
                entry.color.as_str(),
                now
            ],
        )?;

        results.push(CellResult::conquered(
            coord,
            entry.quoted_price,
            price_paid,
            new_price,
        ));
    }

    let report = BatchReport::from_results(results);
    tx.execute(
        "INSERT INTO settlements (settlement_ref, actor_id, report_json, applied_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![settlement_ref, actor.as_str(), serde_json::to_string(&report)?, now],
    )?;
    tx.commit()?;

    info!(
        settlement_ref,
        actor = %actor,
        success = report.success_count,
        skipped = report.skipped_count,
        errors = report.error_count,
        "Batch conquest committed"
    );
    Ok(report)
}

/// Recolor cells the actor owns. Cells owned by someone else are skipped.
pub fn recolor(conn: &mut Connection, entries: &[RecolorEntry], actor: &ActorId) -> Result<BatchReport> {
    let tx = conn.transaction()?;
    let mut results = Vec::with_capacity(entries.len());

    for entry in entries {
        let coord = entry.coord;
        let updated = tx.execute(
            "UPDATE cells SET color = ?1 WHERE x = ?2 AND y = ?3 AND owner_id = ?4",
            params![entry.color.as_str(), coord.x, coord.y, actor.as_str()],
        )?;
        if updated == 1 {
            results.push(CellResult::recolored(coord));
            continue;
        }

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM cells WHERE x = ?1 AND y = ?2)",
            params![coord.x, coord.y],
            |row| row.get(0),
        )?;
        results.push(if exists {
            CellResult::skipped(coord, "Not owned by actor")
        } else {
            CellResult::error(coord, "Cell not found")
        });
    }

    tx.commit()?;
    Ok(BatchReport::from_results(results))
}

/// Sum of every cell's current price, added in decimal
pub fn total_value(conn: &Connection) -> Result<Decimal> {
    let mut stmt = conn.prepare("SELECT current_price FROM cells")?;
    let prices = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut total = Decimal::ZERO;
    for price in prices {
        total += parse_price(&price?)?;
    }
    Ok(total)
}

pub fn conquest_history(conn: &Connection, coord: Coord, limit: u32) -> Result<Vec<ConquestRow>> {
    let mut stmt = conn.prepare(
        "SELECT settlement_ref, from_owner, to_owner, price_paid, new_price, color, conquered_at
         FROM conquests WHERE x = ?1 AND y = ?2
         ORDER BY id DESC LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![coord.x, coord.y, limit], |row| {
            Ok(ConquestRow {
                settlement_ref: row.get(0)?,
                from_owner: row.get(1)?,
                to_owner: row.get(2)?,
                price_paid: row.get(3)?,
                new_price: row.get(4)?,
                color: row.get(5)?,
                conquered_at: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
