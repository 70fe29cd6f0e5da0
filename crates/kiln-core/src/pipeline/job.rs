use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::pipeline::types::{JobId, JobKind, JobRef, JobSpec, JobState, ReservationId};

/// The durable record for a single unit of generation work.
///
/// Created by the submission service in `Queued` state, advanced by exactly
/// one worker at a time, and finalized by that worker. `id`, `kind`,
/// `owner_id`, `spec`, `cost` and `reservation_id` are immutable after
/// creation; everything else is owned by the store's conditional
/// transitions.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub owner_id: String,
    pub spec: JobSpec,
    pub state: JobState,
    /// Execution attempts so far; incremented when a worker claims the job.
    pub attempt: u32,
    /// Credits reserved for this job.
    pub cost: i64,
    pub reservation_id: ReservationId,
    /// Artifact reference; `Some` exactly when `state` is `Succeeded`.
    pub result: Option<String>,
    /// Human-readable cause; `Some` and non-empty exactly when `state` is
    /// `Failed`.
    pub failure_reason: Option<String>,
    /// Whether the reservation has been committed or released.
    pub settled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh `Queued` job with reserved credits.
    pub fn new(
        kind: JobKind,
        owner_id: impl Into<String>,
        spec: JobSpec,
        cost: i64,
        reservation_id: ReservationId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            owner_id: owner_id.into(),
            spec,
            state: JobState::Queued,
            attempt: 0,
            cost,
            reservation_id,
            result: None,
            failure_reason: None,
            settled: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The lightweight reference pushed onto a queue for this job.
    pub fn job_ref(&self) -> JobRef {
        JobRef {
            job_id: self.id,
            kind: self.kind,
        }
    }
}
