//! Read-only status projection over the job store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pipeline::job::Job;
use crate::pipeline::store::JobStore;
use crate::pipeline::types::{JobId, JobKind, JobState, PipelineError};

/// Snapshot of one job returned to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub job_id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Coarse progress figure for dashboards: 100 once succeeded, else 0.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for StatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            state: job.state,
            attempt: job.attempt,
            result: job.result.clone(),
            failure_reason: job.failure_reason.clone(),
            progress: if job.state == JobState::Succeeded { 100 } else { 0 },
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Read-only view over the job store; never mutates state.
///
/// Completion order is unrelated to submission order, so callers poll by
/// job id rather than assuming their earliest submission finishes first.
pub struct StatusService {
    store: Arc<dyn JobStore>,
}

impl StatusService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Current state of one job.
    ///
    /// Ids past the retention window have been purged from the store and
    /// report [`PipelineError::JobNotFound`], same as ids that never
    /// existed.
    pub async fn status(&self, job_id: JobId) -> Result<StatusView, PipelineError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(PipelineError::JobNotFound { job_id })?;
        Ok(StatusView::from(&job))
    }

    /// Every job belonging to `owner_id`, newest first.
    pub async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<StatusView>, PipelineError> {
        let jobs = self.store.list_for_owner(owner_id).await?;
        Ok(jobs.iter().map(StatusView::from).collect())
    }
}
