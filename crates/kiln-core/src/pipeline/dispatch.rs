//! Dispatcher and worker pool.
//!
//! Workers pull references from their kind's queue, claim the job through
//! a conditional state transition, run the backend under a per-kind
//! timeout, and either settle the job or schedule a retry with capped
//! exponential backoff. No store or ledger lock is ever held across a
//! backend call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use strum::IntoEnumIterator;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::pipeline::backend::BackendRegistry;
use crate::pipeline::job::Job;
use crate::pipeline::ledger::Ledger;
use crate::pipeline::queue::{JobEvent, JobQueues, QueueReceivers, TrackingQueue};
use crate::pipeline::settle::resolve_reservation;
use crate::pipeline::store::JobStore;
use crate::pipeline::types::{JobKind, JobRef, JobState, PipelineError};

/// Retry and timeout policy for one job kind.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total execution attempts, first try included.
    pub max_attempts: u32,
    /// Backoff before attempt `n + 1` is `base_delay * 2^(n-1)`, capped at
    /// `max_delay`.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single backend call; hitting it counts as a
    /// retryable failure.
    pub generate_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before re-enqueueing after `attempt` attempts have run.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            generate_timeout: Duration::from_secs(120),
        }
    }
}

/// Per-kind policies with a shared default.
#[derive(Debug, Clone, Default)]
pub struct KindPolicies {
    default: RetryPolicy,
    overrides: HashMap<JobKind, RetryPolicy>,
}

impl KindPolicies {
    /// The stock schedule: three attempts everywhere, a short timeout for
    /// text and a long one for video rendering.
    pub fn standard() -> Self {
        Self::default()
            .with_override(
                JobKind::Text,
                RetryPolicy {
                    generate_timeout: Duration::from_secs(60),
                    ..RetryPolicy::default()
                },
            )
            .with_override(
                JobKind::Video,
                RetryPolicy {
                    generate_timeout: Duration::from_secs(600),
                    ..RetryPolicy::default()
                },
            )
    }

    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            default: policy,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, kind: JobKind, policy: RetryPolicy) -> Self {
        self.overrides.insert(kind, policy);
        self
    }

    pub fn for_kind(&self, kind: JobKind) -> RetryPolicy {
        self.overrides.get(&kind).copied().unwrap_or(self.default)
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker tasks spawned per kind.
    pub workers_per_kind: usize,
    pub policies: KindPolicies,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers_per_kind: 4,
            policies: KindPolicies::standard(),
        }
    }
}

/// Everything a worker needs, shared by `Arc`.
struct DispatchCtx {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn Ledger>,
    queues: JobQueues,
    backends: BackendRegistry,
    tracking: TrackingQueue,
    policies: KindPolicies,
}

/// The worker pool.
///
/// Owns the spawned worker tasks; [`Dispatcher::shutdown`] stops them
/// between jobs and waits for the job in hand to finish.
pub struct Dispatcher {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Validate the registry and start `workers_per_kind` workers per kind.
    pub fn start(
        config: DispatcherConfig,
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn Ledger>,
        queues: JobQueues,
        receivers: QueueReceivers,
        backends: BackendRegistry,
        tracking: TrackingQueue,
    ) -> Result<Self, PipelineError> {
        backends.ensure_complete()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(DispatchCtx {
            store,
            ledger,
            queues,
            backends,
            tracking,
            policies: config.policies,
        });

        let mut workers = Vec::new();
        for kind in JobKind::iter() {
            let rx = receivers.receiver(kind);
            for worker in 0..config.workers_per_kind {
                let ctx = Arc::clone(&ctx);
                let rx = rx.clone();
                let mut shutdown_rx = shutdown_rx.clone();
                workers.push(tokio::spawn(async move {
                    debug!(%kind, worker, "worker started");
                    loop {
                        tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            delivery = rx.recv_async() => match delivery {
                                Ok(job_ref) => process(&ctx, job_ref).await,
                                // Every producer is gone; nothing left to do.
                                Err(_) => break,
                            },
                        }
                    }
                    debug!(%kind, worker, "worker stopped");
                }));
            }
        }

        Ok(Self {
            shutdown_tx,
            workers,
        })
    }

    /// Re-enqueue every non-terminal job found in the store.
    ///
    /// Call once at startup, before accepting new submissions, so that a
    /// crash between pop and completion loses nothing.
    pub async fn recover(
        store: &dyn JobStore,
        queues: &JobQueues,
    ) -> Result<usize, PipelineError> {
        let refs = store.recover_inflight().await?;
        let count = refs.len();
        for job_ref in refs {
            queues.push(job_ref).await?;
        }
        if count > 0 {
            info!(count, "re-enqueued in-flight jobs from a previous run");
        }
        Ok(count)
    }

    /// Signal shutdown and wait for every worker to finish its job in hand.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

/// Drive one delivered reference to a conclusion.
async fn process(ctx: &DispatchCtx, job_ref: JobRef) {
    let JobRef { job_id, kind } = job_ref;

    let job = match ctx.store.get(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            warn!(%job_id, "delivered reference for unknown job");
            return;
        }
        Err(e) => {
            error!(%job_id, error = %e, "failed to load job");
            return;
        }
    };

    // At-least-once de-dupe: a redelivered reference for a finished job
    // must not touch the backend or the ledger again.
    if job.is_terminal() {
        debug!(%job_id, state = %job.state, "dropping redelivered reference for terminal job");
        return;
    }

    // Optimistic claim; losing means another worker owns the job.
    let job = match ctx.store.claim(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            debug!(%job_id, "claim lost to another worker");
            return;
        }
        Err(e) => {
            error!(%job_id, error = %e, "claim failed");
            return;
        }
    };

    // Registry completeness was checked at startup; a miss here means the
    // registry was rebuilt underneath a running dispatcher.
    let Some(backend) = ctx.backends.get(kind) else {
        error!(%job_id, %kind, "no backend registered");
        finish_failure(ctx, &job, "no backend registered for kind").await;
        return;
    };

    let policy = ctx.policies.for_kind(kind);
    info!(%job_id, %kind, attempt = job.attempt, "job started");
    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(policy.generate_timeout, backend.generate(&job.spec)).await;

    match outcome {
        Ok(Ok(artifact)) => {
            finish_success(ctx, &job, &artifact).await;
            info!(
                %job_id,
                %kind,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "job succeeded"
            );
        }
        Ok(Err(err)) if err.is_retryable() && job.attempt < policy.max_attempts => {
            schedule_retry(ctx, &job, policy, &err.to_string()).await;
        }
        Ok(Err(err)) => {
            finish_failure(ctx, &job, &err.to_string()).await;
        }
        Err(_elapsed) if job.attempt < policy.max_attempts => {
            schedule_retry(ctx, &job, policy, "generation timed out").await;
        }
        Err(_elapsed) => {
            finish_failure(ctx, &job, "generation timed out").await;
        }
    }
}

async fn finish_success(ctx: &DispatchCtx, job: &Job, artifact: &str) {
    match ctx.store.complete(job.id, artifact).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(job_id = %job.id, "success transition lost; job no longer running");
            return;
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "failed to record success");
            return;
        }
    }

    let mut settled_job = job.clone();
    settled_job.state = JobState::Succeeded;
    settled_job.result = Some(artifact.to_owned());
    if let Err(e) =
        resolve_reservation(ctx.store.as_ref(), ctx.ledger.as_ref(), &settled_job).await
    {
        // The job stays unsettled; the reconciliation sweep finishes this.
        error!(job_id = %job.id, error = %e, "settlement failed; leaving to reconciliation");
    }

    ctx.tracking.publish(JobEvent {
        job_id: job.id,
        kind: job.kind,
        state: JobState::Succeeded,
        attempt: job.attempt,
        at: Utc::now(),
    });
}

async fn finish_failure(ctx: &DispatchCtx, job: &Job, reason: &str) {
    warn!(
        job_id = %job.id,
        kind = %job.kind,
        attempt = job.attempt,
        reason,
        "job failed permanently"
    );

    match ctx.store.fail(job.id, reason).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(job_id = %job.id, "failure transition lost; job no longer active");
            return;
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "failed to record failure");
            return;
        }
    }

    let mut settled_job = job.clone();
    settled_job.state = JobState::Failed;
    settled_job.failure_reason = Some(reason.to_owned());
    if let Err(e) =
        resolve_reservation(ctx.store.as_ref(), ctx.ledger.as_ref(), &settled_job).await
    {
        error!(job_id = %job.id, error = %e, "settlement failed; leaving to reconciliation");
    }

    ctx.tracking.publish(JobEvent {
        job_id: job.id,
        kind: job.kind,
        state: JobState::Failed,
        attempt: job.attempt,
        at: Utc::now(),
    });
}

async fn schedule_retry(ctx: &DispatchCtx, job: &Job, policy: RetryPolicy, cause: &str) {
    match ctx.store.requeue_for_retry(job.id).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(job_id = %job.id, "retry transition lost; job no longer running");
            return;
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "failed to requeue for retry");
            return;
        }
    }

    let delay = policy.backoff_after(job.attempt);
    info!(
        job_id = %job.id,
        kind = %job.kind,
        attempt = job.attempt,
        delay_ms = delay.as_millis() as u64,
        cause,
        "retrying after backoff"
    );

    let queues = ctx.queues.clone();
    let job_ref = job.job_ref();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = queues.push(job_ref).await {
            // The job stays Queued in the store; startup recovery will
            // re-enqueue it.
            warn!(job_id = %job_ref.job_id, error = %e, "failed to re-enqueue after backoff");
        }
    });
}
