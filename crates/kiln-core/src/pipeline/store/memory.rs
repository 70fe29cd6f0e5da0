use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::JobStore;
use crate::pipeline::job::Job;
use crate::pipeline::types::{JobId, JobRef, JobState, PipelineError};

/// In-memory job store backed by a `tokio::sync::RwLock<HashMap>`.
///
/// The dependency-injection double for [`super::SqliteJobStore`];
/// transition semantics are identical, with the write lock standing in for
/// the database's conditional updates.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), PipelineError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, PipelineError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Job>, PipelineError> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|job| job.owner_id == owner_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn claim(&self, id: JobId) -> Result<Option<Job>, PipelineError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.state != JobState::Queued {
            return Ok(None);
        }
        job.state = JobState::Running;
        job.attempt += 1;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn requeue_for_retry(&self, id: JobId) -> Result<bool, PipelineError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.state != JobState::Running {
            return Ok(false);
        }
        job.state = JobState::Queued;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete(&self, id: JobId, artifact: &str) -> Result<bool, PipelineError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.state != JobState::Running {
            return Ok(false);
        }
        job.state = JobState::Succeeded;
        job.result = Some(artifact.to_owned());
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail(&self, id: JobId, reason: &str) -> Result<bool, PipelineError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.state.is_terminal() {
            return Ok(false);
        }
        job.state = JobState::Failed;
        job.failure_reason = Some(reason.to_owned());
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_settled(&self, id: JobId) -> Result<(), PipelineError> {
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            job.settled = true;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn unsettled_terminal(&self) -> Result<Vec<Job>, PipelineError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.is_terminal() && !job.settled)
            .cloned()
            .collect())
    }

    async fn recover_inflight(&self) -> Result<Vec<JobRef>, PipelineError> {
        let mut jobs = self.jobs.write().await;
        let mut refs = Vec::new();
        for job in jobs.values_mut() {
            if job.state == JobState::Running {
                job.state = JobState::Queued;
                job.updated_at = Utc::now();
            }
            if job.state == JobState::Queued {
                refs.push(job.job_ref());
            }
        }
        Ok(refs)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, PipelineError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| !(job.is_terminal() && job.updated_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{JobKind, JobSpec};
    use uuid::Uuid;

    fn queued_job() -> Job {
        Job::new(
            JobKind::Text,
            "ada",
            JobSpec::prompt("hello"),
            1,
            Uuid::new_v4(),
        )
    }

    #[tokio::test]
    async fn claim_has_a_single_winner() {
        let store = MemoryJobStore::new();
        let job = queued_job();
        store.insert(&job).await.unwrap();

        let first = store.claim(job.id).await.unwrap();
        let second = store.claim(job.id).await.unwrap();

        let claimed = first.expect("first claim wins");
        assert_eq!(claimed.state, JobState::Running);
        assert_eq!(claimed.attempt, 1);
        assert!(second.is_none(), "second claim must lose");
    }

    #[tokio::test]
    async fn terminal_jobs_cannot_be_claimed_or_failed_again() {
        let store = MemoryJobStore::new();
        let job = queued_job();
        store.insert(&job).await.unwrap();

        store.claim(job.id).await.unwrap();
        assert!(store.complete(job.id, "https://cdn/a.png").await.unwrap());

        assert!(store.claim(job.id).await.unwrap().is_none());
        assert!(!store.fail(job.id, "late failure").await.unwrap());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Succeeded);
        assert_eq!(stored.result.as_deref(), Some("https://cdn/a.png"));
    }

    #[tokio::test]
    async fn recover_requeues_running_and_preserves_attempt() {
        let store = MemoryJobStore::new();
        let job = queued_job();
        store.insert(&job).await.unwrap();
        store.claim(job.id).await.unwrap();

        let refs = store.recover_inflight().await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].job_id, job.id);

        let recovered = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(recovered.state, JobState::Queued);
        assert_eq!(recovered.attempt, 1, "attempt survives recovery");
    }
}
