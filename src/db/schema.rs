//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        conn.execute_batch(CELLS_SCHEMA)?;
        conn.execute_batch(LEDGER_SCHEMA)?;
        conn.execute_batch(JOBS_SCHEMA)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Grid cells. Prices are decimal strings so no precision is lost.
const CELLS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cells (
    x INTEGER NOT NULL,
    y INTEGER NOT NULL,
    color TEXT NOT NULL,
    current_price TEXT NOT NULL,
    owner_id TEXT,
    conquest_count INTEGER NOT NULL DEFAULT 0,
    last_settlement_ref TEXT,
    last_conquered_at TEXT,
    PRIMARY KEY (x, y)
);

CREATE INDEX IF NOT EXISTS idx_cells_owner ON cells(owner_id);
"#;

const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS settlements (
    settlement_ref TEXT PRIMARY KEY,
    actor_id TEXT NOT NULL,
    report_json TEXT NOT NULL,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conquests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    x INTEGER NOT NULL,
    y INTEGER NOT NULL,
    settlement_ref TEXT NOT NULL,
    from_owner TEXT,
    to_owner TEXT NOT NULL,
    price_paid TEXT NOT NULL,
    new_price TEXT NOT NULL,
    color TEXT NOT NULL,
    conquered_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conquests_cell ON conquests(x, y);
CREATE INDEX IF NOT EXISTS idx_conquests_settlement ON conquests(settlement_ref);
"#;

const JOBS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    actor_id TEXT NOT NULL,
    batch_json TEXT NOT NULL,
    total_price TEXT NOT NULL,
    credential_ref TEXT NOT NULL,
    result_json TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at);
"#;
