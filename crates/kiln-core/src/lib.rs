//! kiln-core – the asynchronous job pipeline of a credit-metered AI
//! generation service.
//!
//! Submission reserves credits and enqueues a job reference; a worker pool
//! pulls references, runs the registered generation backend with a per-kind
//! timeout and retry policy, and settles credits exactly once at the
//! terminal transition. A status service projects the job store for
//! polling, and a reconciler heals settlements interrupted by crashes.
//!
//! All collaborators (store, ledger, backends, queues) are capabilities
//! injected at construction, so every piece can be exercised against
//! in-memory doubles.

pub mod pipeline;

pub use pipeline::backend::{BackendRegistry, GenerationBackend};
pub use pipeline::dispatch::{Dispatcher, DispatcherConfig, KindPolicies, RetryPolicy};
pub use pipeline::job::Job;
pub use pipeline::ledger::{Ledger, MemoryLedger, SqliteLedger};
pub use pipeline::pricing::PriceTable;
pub use pipeline::queue::{
    spawn_audit_logger, JobEvent, JobQueues, QueueReceivers, TrackingQueue,
};
pub use pipeline::reconcile::{ReconcileReport, Reconciler};
pub use pipeline::status::{StatusService, StatusView};
pub use pipeline::store::{JobStore, MemoryJobStore, SqliteJobStore};
pub use pipeline::submit::{JobHandle, SubmissionService};
pub use pipeline::types::{
    GenerateError, JobId, JobKind, JobRef, JobSpec, JobState, PipelineError, ReservationId,
};
