//! Credit settlement.
//!
//! The single owner of debit and refund: a terminal transition commits the
//! reservation on success and releases it on failure, then records the job
//! as settled. Both the dispatcher (at the terminal transition) and the
//! reconciler (after a crash) funnel through here. The ledger consumes a
//! reservation at most once, so the loser of any race observes
//! `UnknownReservation` and only has the settled flag left to write.

use tracing::warn;

use crate::pipeline::job::Job;
use crate::pipeline::ledger::Ledger;
use crate::pipeline::store::JobStore;
use crate::pipeline::types::{JobState, PipelineError};

/// Resolve a terminal job's reservation and mark it settled.
pub(crate) async fn resolve_reservation(
    store: &dyn JobStore,
    ledger: &dyn Ledger,
    job: &Job,
) -> Result<(), PipelineError> {
    let outcome = match job.state {
        JobState::Succeeded => ledger.commit(job.reservation_id).await,
        JobState::Failed => ledger.release(job.reservation_id).await,
        _ => {
            return Err(PipelineError::Ledger(format!(
                "settlement requested for non-terminal job {}",
                job.id
            )));
        }
    };

    match outcome {
        Ok(()) => {}
        Err(PipelineError::UnknownReservation { .. }) => {
            // A previous, partially completed settlement already consumed
            // the reservation; the credits moved exactly once and only the
            // flag is missing.
            warn!(job_id = %job.id, "reservation already resolved");
        }
        Err(e) => return Err(e),
    }

    store.mark_settled(job.id).await
}
