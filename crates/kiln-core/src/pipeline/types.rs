use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a submitted job.
pub type JobId = Uuid;

/// Handle into the ledger for the credits held against a job.
pub type ReservationId = Uuid;

/// Content kind of a generation job.
///
/// Determines which queue carries the job, which backend executes it, and
/// which retry policy applies.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Text,
    Image,
    Voice,
    Video,
}

/// Lifecycle state of a job.
///
/// States only move forward: `Queued -> Running -> (Succeeded | Failed)`,
/// with any number of `Running -> Queued` retry cycles before a terminal
/// state. Terminal jobs never transition again.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    /// Returns `true` once the job can never transition again.
    ///
    /// Callers that poll status until the job is done should use this
    /// method rather than matching individual variants.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// What the client asked a backend to produce.
///
/// Opaque to the pipeline apart from the minimal validation in submission
/// and the variant used for pricing; immutable after job creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub prompt: String,
    /// Sub-type within the kind (e.g. a `"commercial"` video). Mandatory
    /// for video, optional elsewhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Arbitrary backend options forwarded untouched.
    #[serde(default)]
    pub options: serde_json::Value,
}

impl JobSpec {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            variant: None,
            options: serde_json::Value::Null,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}

/// Lightweight reference delivered through a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobRef {
    pub job_id: JobId,
    pub kind: JobKind,
}

/// Failure returned by a generation backend.
///
/// Transient failures (network, rate limit, upstream hiccup) are retried
/// by the dispatcher up to the kind's attempt budget; rejected requests
/// (e.g. a content policy refusal) fail the job immediately.
#[derive(Debug, Clone, Error)]
pub enum GenerateError {
    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("generation rejected: {0}")]
    Rejected(String),
}

impl GenerateError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerateError::Transient(_))
    }
}

/// Errors produced by the pipeline layer.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// The submitted spec does not meet the kind's minimal requirements.
    #[error("invalid {kind} spec: {reason}")]
    InvalidSpec { kind: JobKind, reason: String },

    /// The owner's balance cannot cover the job's cost.
    #[error("insufficient credits for '{owner_id}': {required} required")]
    InsufficientCredits { owner_id: String, required: i64 },

    /// The job record exists but never reached a queue; the submission was
    /// rolled back.
    #[error("enqueue failed for job {job_id}: {reason}")]
    EnqueueFailed { job_id: JobId, reason: String },

    /// The referenced job does not exist (or was purged past retention).
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    /// No backend registered for the kind; caught at dispatcher startup.
    #[error("no backend registered for kind '{kind}'")]
    BackendMissing { kind: JobKind },

    /// The reservation was already consumed or never existed.
    #[error("reservation not found: {reservation_id}")]
    UnknownReservation { reservation_id: ReservationId },

    /// Propagated from the job store.
    #[error("store error: {0}")]
    Store(String),

    /// Propagated from the ledger.
    #[error("ledger error: {0}")]
    Ledger(String),
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::Store(e.to_string())
    }
}
