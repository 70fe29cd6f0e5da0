//! Request intake.
//!
//! Submission validates the spec, reserves credits, records the job, and
//! enqueues a reference for the worker pool, then returns immediately; it
//! never blocks on generation. Everything after the enqueue is surfaced
//! through status polling only.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::pipeline::job::Job;
use crate::pipeline::ledger::Ledger;
use crate::pipeline::pricing::PriceTable;
use crate::pipeline::queue::{JobEvent, JobQueues, TrackingQueue};
use crate::pipeline::store::JobStore;
use crate::pipeline::types::{JobId, JobKind, JobSpec, PipelineError};

/// Returned to the caller immediately on submission.
#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    pub job_id: JobId,
    /// Poll path for the status endpoint.
    pub status_handle: String,
}

/// Validates a request, reserves credits, and hands the job to the queues.
///
/// All collaborators are injected at construction so tests can substitute
/// doubles for the ledger and store.
pub struct SubmissionService {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn Ledger>,
    queues: JobQueues,
    tracking: TrackingQueue,
    prices: PriceTable,
}

impl SubmissionService {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn Ledger>,
        queues: JobQueues,
        tracking: TrackingQueue,
        prices: PriceTable,
    ) -> Self {
        Self {
            store,
            ledger,
            queues,
            tracking,
            prices,
        }
    }

    /// Submit one unit of generation work.
    ///
    /// Credits are reserved before the job record exists, so concurrent
    /// submissions can never overdraw a balance. A reservation that cannot
    /// be followed by a queued job is always undone; no path leaves an
    /// orphaned reservation behind.
    pub async fn submit(
        &self,
        owner_id: &str,
        kind: JobKind,
        spec: JobSpec,
    ) -> Result<JobHandle, PipelineError> {
        validate_spec(kind, &spec)?;
        let cost = self.prices.price(kind, &spec)?;

        let reservation_id = self.ledger.reserve(owner_id, cost).await?;

        let job = Job::new(kind, owner_id, spec, cost, reservation_id);
        let job_id = job.id;
        if let Err(e) = self.store.insert(&job).await {
            // No job record exists; only the reservation needs undoing.
            if let Err(release_err) = self.ledger.release(reservation_id).await {
                error!(
                    %job_id,
                    error = %release_err,
                    "failed to release reservation after insert failure"
                );
            }
            return Err(e);
        }

        if let Err(e) = self.queues.push(job.job_ref()).await {
            self.rollback_enqueue(&job).await;
            warn!(%job_id, %kind, error = %e, "enqueue failed; submission rolled back");
            return Err(e);
        }

        info!(%job_id, %kind, owner_id, cost, "job submitted");
        Ok(JobHandle {
            job_id,
            status_handle: format!("/jobs/{job_id}/status"),
        })
    }

    /// The job record exists but never reached a queue: fail it, release
    /// the reservation, and mark it settled so the reconciler skips it.
    async fn rollback_enqueue(&self, job: &Job) {
        match self.store.fail(job.id, "enqueue failed").await {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %job.id, "rollback found job no longer queued"),
            Err(e) => error!(job_id = %job.id, error = %e, "failed to mark job failed during rollback"),
        }

        match self.ledger.release(job.reservation_id).await {
            Ok(()) | Err(PipelineError::UnknownReservation { .. }) => {}
            Err(e) => {
                // Leave the job unsettled; the reconciliation sweep retries
                // the release.
                error!(job_id = %job.id, error = %e, "failed to release reservation during rollback");
                return;
            }
        }

        if let Err(e) = self.store.mark_settled(job.id).await {
            error!(job_id = %job.id, error = %e, "failed to mark job settled during rollback");
        }

        self.tracking.publish(JobEvent {
            job_id: job.id,
            kind: job.kind,
            state: crate::pipeline::types::JobState::Failed,
            attempt: job.attempt,
            at: Utc::now(),
        });
    }
}

/// Minimal per-kind requirement: every kind needs a non-blank prompt.
/// Variant checks live in the price table.
fn validate_spec(kind: JobKind, spec: &JobSpec) -> Result<(), PipelineError> {
    if spec.prompt.trim().is_empty() {
        return Err(PipelineError::InvalidSpec {
            kind,
            reason: "prompt is required".to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::JobKind;

    #[test]
    fn blank_prompts_are_rejected() {
        let empty = JobSpec::prompt("");
        assert!(matches!(
            validate_spec(JobKind::Text, &empty),
            Err(PipelineError::InvalidSpec { .. })
        ));

        let whitespace = JobSpec::prompt("   \n\t");
        assert!(matches!(
            validate_spec(JobKind::Voice, &whitespace),
            Err(PipelineError::InvalidSpec { .. })
        ));

        let ok = JobSpec::prompt("narrate this");
        assert!(validate_spec(JobKind::Voice, &ok).is_ok());
    }
}
