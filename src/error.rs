//! Error types for the conquest pipeline

use thiserror::Error;

use crate::jobs::JobStatus;

#[derive(Error, Debug)]
pub enum ConquestError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid cell ({x}, {y}): {reason}")]
    InvalidCell { x: i64, y: i64, reason: String },

    #[error("Too many cells: {requested} requested, at most {max} allowed")]
    TooManyCells { requested: usize, max: usize },

    #[error("Cell ({x}, {y}) not found")]
    CellNotFound { x: u32, y: u32 },

    #[error("Invalid credential: {0}")]
    Credential(String),

    #[error("Rate limit exceeded, retry after {reset_at_ms}")]
    RateLimited { reset_at_ms: i64 },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid job transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Settlement transport error: {0}")]
    Settlement(String),

    #[error("Sealing error: {0}")]
    Sealing(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConquestError {
    /// Input and admission errors are the caller's to fix; everything else is ours.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ConquestError::InvalidInput(_)
                | ConquestError::InvalidCell { .. }
                | ConquestError::TooManyCells { .. }
                | ConquestError::CellNotFound { .. }
                | ConquestError::Credential(_)
                | ConquestError::RateLimited { .. }
                | ConquestError::JobNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConquestError>;
