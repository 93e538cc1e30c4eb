//! Conquest - grid cell conquest transaction pipeline
//!
//! Actors buy cells on a fixed grid. Every successful conquest raises the
//! cell's price by 20%. A request flows through:
//!
//! ```text
//! rate limiter -> batch validator -> (inline | durable job) -> payment gateway -> committer
//! ```
//!
//! and the [`jobs::Sweeper`] re-drives jobs left `pending` by a crashed or
//! slow background execution.
//!
//! ## Modules
//!
//! - [`pricing`] - Price escalation and display formatting
//! - [`rate_limit`] - Sliding-window admission control
//! - [`validator`] - Batch validation and partitioning
//! - [`payment`] - Settlement gateways
//! - [`committer`] - Atomic commit with paid-but-not-committed reporting
//! - [`jobs`] - Durable job queue and sweeper
//! - [`store`] / [`db`] - Authoritative cell state in SQLite
//! - [`service`] - Orchestration
//! - [`http`] - HTTP API

pub mod committer;
pub mod config;
pub mod credential;
pub mod db;
pub mod error;
pub mod grid;
pub mod http;
pub mod jobs;
pub mod payment;
pub mod pipeline;
pub mod pricing;
pub mod rate_limit;
pub mod service;
pub mod store;
pub mod validator;

pub use error::{ConquestError, Result};
pub use grid::{ActorId, Cell, CellRequest, Color, Coord, GridBounds};
pub use jobs::{ConquestResult, JobQueue, JobStatus, JobView, Sweeper};
pub use pipeline::Pipeline;
pub use service::{ConquestReceipt, ConquestRequest, ConquestService, SubmitOutcome};
