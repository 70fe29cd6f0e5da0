//! Per-kind job handoff queues and the terminal-event tracking stream.
//!
//! Delivery is at-least-once: a reference may be pushed again for a retry,
//! and startup recovery re-pushes every non-terminal job found in the
//! store. Workers de-duplicate by checking the job's state before claiming
//! it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use strum::IntoEnumIterator;
use tracing::{info, warn};

use crate::pipeline::types::{JobId, JobKind, JobRef, JobState, PipelineError};

/// Producer side of the per-kind FIFO channels.
///
/// Cheap to clone; every clone pushes into the same channels.
#[derive(Debug, Clone)]
pub struct JobQueues {
    senders: HashMap<JobKind, flume::Sender<JobRef>>,
}

/// Consumer side, handed to the dispatcher at startup.
///
/// Dropping every receiver (including worker clones) disconnects the
/// channel, after which pushes fail and submissions roll back.
#[derive(Debug)]
pub struct QueueReceivers {
    receivers: HashMap<JobKind, flume::Receiver<JobRef>>,
}

impl JobQueues {
    /// Create the per-kind channels, each bounded to `capacity`.
    pub fn new(capacity: usize) -> (Self, QueueReceivers) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for kind in JobKind::iter() {
            let (tx, rx) = flume::bounded(capacity);
            senders.insert(kind, tx);
            receivers.insert(kind, rx);
        }
        (Self { senders }, QueueReceivers { receivers })
    }

    /// Push a reference onto its kind's queue.
    ///
    /// Awaits while the queue is at capacity; fails only when the consumer
    /// side is gone.
    pub async fn push(&self, job_ref: JobRef) -> Result<(), PipelineError> {
        let tx = self
            .senders
            .get(&job_ref.kind)
            .expect("a channel exists for every kind");
        tx.send_async(job_ref)
            .await
            .map_err(|_| PipelineError::EnqueueFailed {
                job_id: job_ref.job_id,
                reason: format!("{} queue disconnected", job_ref.kind),
            })
    }
}

impl QueueReceivers {
    /// A worker-side receiver for `kind`. Receivers are cloneable; workers
    /// sharing one compete for deliveries, preserving FIFO handoff.
    pub fn receiver(&self, kind: JobKind) -> flume::Receiver<JobRef> {
        self.receivers
            .get(&kind)
            .expect("a channel exists for every kind")
            .clone()
    }
}

/// Copy of a terminal transition, published for auditing.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// Unbounded audit stream fed on every terminal transition.
///
/// Decoupled from the per-kind queues so that a tracking failure never
/// blocks primary processing or settlement.
#[derive(Debug, Clone)]
pub struct TrackingQueue {
    tx: flume::Sender<JobEvent>,
    rx: flume::Receiver<JobEvent>,
}

impl TrackingQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// Best-effort publish; a disconnected stream is logged and ignored.
    pub fn publish(&self, event: JobEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "failed to publish tracking event");
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<JobEvent> {
        self.rx.clone()
    }
}

impl Default for TrackingQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain the tracking stream into the log.
///
/// Runs until every sender is gone. Subscribers compete for events, so a
/// deployment wanting both logging and its own consumer should fan out
/// from a single subscription.
pub fn spawn_audit_logger(rx: flume::Receiver<JobEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(event) = rx.recv_async().await {
            info!(
                job_id = %event.job_id,
                kind = %event.kind,
                state = %event.state,
                attempt = event.attempt,
                "job reached terminal state"
            );
        }
    })
}
