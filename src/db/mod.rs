//! SQLite persistence for cells and conquest jobs
//!
//! One database file holds the authoritative grid state and the job table.
//! Job records must outlive the process that enqueued them, so the job queue
//! never keeps the only copy of a job in memory.
//!
//! ## Tables
//!
//! - `cells` - Grid cell state (price, owner, color, conquest count)
//! - `conquests` - Ledger of committed conquests, one row per cell per settlement
//! - `settlements` - Applied settlement references with their batch report (replay guard)
//! - `jobs` - Asynchronous conquest jobs and their results

pub mod cells;
pub mod jobs;
pub mod schema;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::{ConquestError, Result};

/// SQLite database shared by the cell store and the job queue
pub struct ConquestDb {
    conn: Mutex<Connection>,
}

impl ConquestDb {
    /// Open or create the database file
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening SQLite database at {:?}", path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read or single-statement write with the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ConquestError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run a write that needs exclusive access (transactions)
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| ConquestError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Row counts and grid value for the health endpoint
    pub fn stats(&self) -> Result<DbStats> {
        self.with_conn(|conn| {
            let cells: i64 = conn.query_row("SELECT COUNT(*) FROM cells", [], |row| row.get(0))?;
            let owned: i64 = conn.query_row(
                "SELECT COUNT(*) FROM cells WHERE owner_id IS NOT NULL",
                [],
                |row| row.get(0),
            )?;
            let pending_jobs: i64 = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?;
            let conquests: i64 =
                conn.query_row("SELECT COUNT(*) FROM conquests", [], |row| row.get(0))?;
            let total_value = cells::total_value(conn)?;

            Ok(DbStats {
                cells: cells as u64,
                owned_cells: owned as u64,
                pending_jobs: pending_jobs as u64,
                conquests: conquests as u64,
                total_value,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbStats {
    pub cells: u64,
    pub owned_cells: u64,
    pub pending_jobs: u64,
    pub conquests: u64,
    /// Sum of current prices across the grid
    pub total_value: Decimal,
}
