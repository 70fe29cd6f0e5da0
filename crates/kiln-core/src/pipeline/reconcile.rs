//! Settlement reconciliation and retention.
//!
//! A worker can crash between writing a terminal state and resolving the
//! reservation. The reconciler heals that gap: it scans for terminal jobs
//! still marked unsettled and resolves them (commit for succeeded, release
//! for failed), relying on the ledger's consume-once semantics to stay
//! safe if the crashed worker had in fact gotten the ledger call through.
//! The same pass garbage-collects terminal jobs past the retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::pipeline::ledger::Ledger;
use crate::pipeline::settle::resolve_reservation;
use crate::pipeline::store::JobStore;
use crate::pipeline::types::PipelineError;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Reservations resolved for terminal jobs that crashed mid-settlement.
    pub resolved: usize,
    /// Terminal jobs dropped past the retention window.
    pub purged: u64,
}

pub struct Reconciler {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn Ledger>,
    retention: chrono::Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn JobStore>, ledger: Arc<dyn Ledger>, retention: Duration) -> Self {
        Self {
            store,
            ledger,
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
        }
    }

    /// One full pass: resolve unsettled terminal jobs, then purge expired
    /// ones.
    pub async fn run_once(&self) -> Result<ReconcileReport, PipelineError> {
        let mut report = ReconcileReport::default();

        for job in self.store.unsettled_terminal().await? {
            match resolve_reservation(self.store.as_ref(), self.ledger.as_ref(), &job).await {
                Ok(()) => {
                    info!(job_id = %job.id, state = %job.state, "resolved orphaned reservation");
                    report.resolved += 1;
                }
                Err(e) => {
                    // Left unsettled; the next pass retries.
                    error!(job_id = %job.id, error = %e, "reconciliation failed for job");
                }
            }
        }

        report.purged = self
            .store
            .purge_terminal_before(Utc::now() - self.retention)
            .await?;

        Ok(report)
    }

    /// Run [`Reconciler::run_once`] every `interval` until `shutdown_rx`
    /// flips.
    pub fn spawn(self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => match self.run_once().await {
                        Ok(report) if report.resolved > 0 || report.purged > 0 => {
                            info!(
                                resolved = report.resolved,
                                purged = report.purged,
                                "reconciliation pass finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "reconciliation pass failed"),
                    },
                }
            }
        })
    }
}
