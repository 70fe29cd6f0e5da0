//! SQLite implementation of [`JobStore`].
//!
//! Uses [`sqlx`] with the `sqlite` feature; migrations are embedded at
//! compile time and run on connect. The `sqlx::query` (runtime-verified)
//! form is used deliberately so that no `DATABASE_URL` environment
//! variable is needed at compile time.
//!
//! Every state transition is a conditional `UPDATE ... WHERE state = ...`;
//! `rows_affected` decides whether this caller won the transition, which
//! is what makes a claim safe under concurrent workers and redelivered
//! references.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::warn;

use super::{JobStore, MIGRATOR};
use crate::pipeline::job::Job;
use crate::pipeline::types::{JobId, JobRef, PipelineError};

/// One row of the `jobs` table, in column order.
type JobRow = (
    String,         // id
    String,         // kind
    String,         // owner_id
    String,         // spec (JSON)
    String,         // state
    i64,            // attempt
    i64,            // cost
    String,         // reservation_id
    Option<String>, // result
    Option<String>, // failure_reason
    i64,            // settled
    String,         // created_at
    String,         // updated_at
);

const JOB_COLUMNS: &str = "id, kind, owner_id, spec, state, attempt, cost, reservation_id, \
     result, failure_reason, settled, created_at, updated_at";

/// SQLite-backed job store.
#[derive(Clone, Debug)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (or create) the SQLite database at `url` and run pending
    /// migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g.
    /// `"sqlite://kiln.db"`.
    pub async fn connect(url: &str) -> Result<Self, PipelineError> {
        let pool = SqlitePool::connect(url).await?;
        Self::from_pool(pool).await
    }

    /// Build a store over an existing pool, running pending migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, PipelineError> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| PipelineError::Store(e.to_string()))?;
        Ok(Self { pool })
    }

    /// The underlying pool, for sharing with [`crate::pipeline::ledger::SqliteLedger`].
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_timestamp(raw: &str, column: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|e: chrono::ParseError| {
        warn!(raw = %raw, column, error = %e, "failed to parse job timestamp; using now");
        Utc::now()
    })
}

fn row_to_job(row: JobRow) -> Result<Job, PipelineError> {
    let (
        id,
        kind,
        owner_id,
        spec,
        state,
        attempt,
        cost,
        reservation_id,
        result,
        failure_reason,
        settled,
        created_at,
        updated_at,
    ) = row;

    Ok(Job {
        id: id
            .parse()
            .map_err(|e| PipelineError::Store(format!("bad job id '{id}': {e}")))?,
        kind: kind
            .parse()
            .map_err(|e| PipelineError::Store(format!("bad job kind '{kind}': {e}")))?,
        owner_id,
        spec: serde_json::from_str(&spec)
            .map_err(|e| PipelineError::Store(format!("bad job spec: {e}")))?,
        state: state
            .parse()
            .map_err(|e| PipelineError::Store(format!("bad job state '{state}': {e}")))?,
        attempt: attempt as u32,
        cost,
        reservation_id: reservation_id.parse().map_err(|e| {
            PipelineError::Store(format!("bad reservation id '{reservation_id}': {e}"))
        })?,
        result,
        failure_reason,
        settled: settled != 0,
        created_at: parse_timestamp(&created_at, "created_at"),
        updated_at: parse_timestamp(&updated_at, "updated_at"),
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &Job) -> Result<(), PipelineError> {
        let spec = serde_json::to_string(&job.spec)
            .map_err(|e| PipelineError::Store(format!("failed to serialize job spec: {e}")))?;
        sqlx::query(
            "INSERT INTO jobs (id, kind, owner_id, spec, state, attempt, cost, reservation_id, \
             result, failure_reason, settled, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(job.id.to_string())
        .bind(job.kind.to_string())
        .bind(&job.owner_id)
        .bind(&spec)
        .bind(job.state.to_string())
        .bind(job.attempt as i64)
        .bind(job.cost)
        .bind(job.reservation_id.to_string())
        .bind(&job.result)
        .bind(&job.failure_reason)
        .bind(job.settled as i64)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, PipelineError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_job).transpose()
    }

    async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Job>, PipelineError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE owner_id = ?1 ORDER BY created_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    async fn claim(&self, id: JobId) -> Result<Option<Job>, PipelineError> {
        let updated = sqlx::query(
            "UPDATE jobs SET state = 'running', attempt = attempt + 1, updated_at = ?1 \
             WHERE id = ?2 AND state = 'queued'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    async fn requeue_for_retry(&self, id: JobId) -> Result<bool, PipelineError> {
        let updated = sqlx::query(
            "UPDATE jobs SET state = 'queued', updated_at = ?1 \
             WHERE id = ?2 AND state = 'running'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn complete(&self, id: JobId, artifact: &str) -> Result<bool, PipelineError> {
        let updated = sqlx::query(
            "UPDATE jobs SET state = 'succeeded', result = ?1, updated_at = ?2 \
             WHERE id = ?3 AND state = 'running'",
        )
        .bind(artifact)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn fail(&self, id: JobId, reason: &str) -> Result<bool, PipelineError> {
        let updated = sqlx::query(
            "UPDATE jobs SET state = 'failed', failure_reason = ?1, updated_at = ?2 \
             WHERE id = ?3 AND state IN ('queued', 'running')",
        )
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn mark_settled(&self, id: JobId) -> Result<(), PipelineError> {
        sqlx::query("UPDATE jobs SET settled = 1, updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unsettled_terminal(&self) -> Result<Vec<Job>, PipelineError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE state IN ('succeeded', 'failed') AND settled = 0"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    async fn recover_inflight(&self) -> Result<Vec<JobRef>, PipelineError> {
        let requeued = sqlx::query(
            "UPDATE jobs SET state = 'queued', updated_at = ?1 WHERE state = 'running'",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        if requeued.rows_affected() > 0 {
            warn!(
                count = requeued.rows_affected(),
                "requeued jobs left running by a previous process"
            );
        }

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT id, kind FROM jobs WHERE state = 'queued' ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(id, kind)| {
                Ok(JobRef {
                    job_id: id
                        .parse()
                        .map_err(|e| PipelineError::Store(format!("bad job id '{id}': {e}")))?,
                    kind: kind
                        .parse()
                        .map_err(|e| PipelineError::Store(format!("bad job kind '{kind}': {e}")))?,
                })
            })
            .collect()
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, PipelineError> {
        // Timestamps are stored as RFC 3339 UTC text, so lexicographic
        // comparison matches chronological order.
        let deleted = sqlx::query(
            "DELETE FROM jobs WHERE state IN ('succeeded', 'failed') AND updated_at < ?1",
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(deleted.rows_affected())
    }
}
