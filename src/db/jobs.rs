//! Job table queries
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings so that string
//! order is time order (`ORDER BY created_at`, cutoff comparisons).

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::Result;
use crate::grid::ActorId;
use crate::jobs::{ConquestResult, Job, JobStatus};

const JOB_COLUMNS: &str =
    "id, status, actor_id, batch_json, total_price, result_json, created_at, updated_at, credential_ref";

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_time(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

/// Map a row selected with [`JOB_COLUMNS`] to the job and its sealed credential
fn job_from_row(row: &Row) -> rusqlite::Result<(Job, String)> {
    let status: String = row.get(1)?;
    let batch_json: String = row.get(3)?;
    let total_price: String = row.get(4)?;
    let result_json: Option<String> = row.get(5)?;

    let result = result_json
        .map(|json| serde_json::from_str::<ConquestResult>(&json))
        .transpose()
        .map_err(|e| conversion_error(5, e))?;

    let job = Job {
        id: row.get(0)?,
        status: JobStatus::parse(&status).map_err(|e| conversion_error(1, e))?,
        actor_id: ActorId::new(row.get::<_, String>(2)?),
        batch: serde_json::from_str(&batch_json).map_err(|e| conversion_error(3, e))?,
        total_price: Decimal::from_str(&total_price).map_err(|e| conversion_error(4, e))?,
        result,
        created_at: parse_time(row, 6)?,
        updated_at: parse_time(row, 7)?,
    };
    Ok((job, row.get(8)?))
}

pub fn insert(conn: &Connection, job: &Job, credential_ref: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO jobs (id, status, actor_id, batch_json, total_price, credential_ref,
                           result_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            job.id,
            job.status.as_str(),
            job.actor_id.as_str(),
            serde_json::to_string(&job.batch)?,
            job.total_price.to_string(),
            credential_ref,
            job.result.as_ref().map(serde_json::to_string).transpose()?,
            timestamp(job.created_at),
            timestamp(job.updated_at),
        ],
    )?;
    Ok(())
}

/// Load a job together with its sealed credential
pub fn get(conn: &Connection, id: &str) -> Result<Option<(Job, String)>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], job_from_row).optional()?)
}

/// Move `id` from `from` to `to` only if it is still in `from`. Returns rows changed.
pub fn update_status(
    conn: &Connection,
    id: &str,
    from: JobStatus,
    to: JobStatus,
    result: Option<&ConquestResult>,
    at: DateTime<Utc>,
) -> Result<usize> {
    let result_json = result.map(serde_json::to_string).transpose()?;
    Ok(conn.execute(
        "UPDATE jobs SET status = ?1, result_json = COALESCE(?2, result_json), updated_at = ?3
         WHERE id = ?4 AND status = ?5",
        params![to.as_str(), result_json, timestamp(at), id, from.as_str()],
    )?)
}

/// Ids of the oldest pending jobs
pub fn oldest_pending(conn: &Connection, limit: usize) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM jobs WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?1",
    )?;
    let ids = stmt
        .query_map([limit as i64], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

/// Delete terminal jobs created before `cutoff`
pub fn purge_before(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND created_at < ?1",
        [timestamp(cutoff)],
    )?)
}
