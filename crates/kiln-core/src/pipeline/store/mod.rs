//! Durable job records.
//!
//! The store is the single source of truth for status polling and the
//! coordination point between workers: every state change is a conditional
//! transition that applies on at most one caller, so a reference delivered
//! twice (at-least-once queues) still results in a single execution.

mod memory;
mod sqlite;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::pipeline::job::Job;
use crate::pipeline::types::{JobId, JobRef, PipelineError};

/// Embedded migrations, shared with the SQLite ledger.
///
/// The path is resolved at compile time relative to the crate root, so the
/// directory is baked into the binary.
pub(crate) static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn insert(&self, job: &Job) -> Result<(), PipelineError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, PipelineError>;

    /// Jobs belonging to `owner_id`, newest first.
    async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Job>, PipelineError>;

    /// Conditionally transition `Queued -> Running`, incrementing
    /// `attempt`. Returns the claimed job, or `None` when another worker
    /// already owns it or the job is not queued.
    async fn claim(&self, id: JobId) -> Result<Option<Job>, PipelineError>;

    /// `Running -> Queued` ahead of a retry, preserving `attempt`.
    /// Returns whether the transition applied.
    async fn requeue_for_retry(&self, id: JobId) -> Result<bool, PipelineError>;

    /// `Running -> Succeeded`, recording the artifact reference.
    async fn complete(&self, id: JobId, artifact: &str) -> Result<bool, PipelineError>;

    /// `Queued | Running -> Failed`, recording a non-empty reason.
    async fn fail(&self, id: JobId, reason: &str) -> Result<bool, PipelineError>;

    /// Record that the job's reservation has been resolved.
    async fn mark_settled(&self, id: JobId) -> Result<(), PipelineError>;

    /// Terminal jobs whose reservation was never resolved; input to the
    /// reconciliation sweep.
    async fn unsettled_terminal(&self) -> Result<Vec<Job>, PipelineError>;

    /// Startup recovery: move `Running` jobs back to `Queued` (the worker
    /// that owned them is gone) and return a reference for every
    /// non-terminal job so it can be re-enqueued.
    async fn recover_inflight(&self) -> Result<Vec<JobRef>, PipelineError>;

    /// Drop terminal jobs last updated before `cutoff`. Returns the count.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, PipelineError>;
}
