use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::Ledger;
use crate::pipeline::types::{PipelineError, ReservationId};

#[derive(Debug)]
struct Hold {
    owner_id: String,
    amount: i64,
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<String, i64>,
    held: HashMap<ReservationId, Hold>,
}

/// In-process ledger.
///
/// The dependency-injection double for [`super::SqliteLedger`]; also
/// usable as-is by single-node deployments that keep balances elsewhere.
/// One mutex serializes all balance changes, which trivially satisfies the
/// per-owner serialization requirement.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add credits to an account, creating it if needed.
    pub async fn credit(&self, owner_id: &str, amount: i64) {
        let mut state = self.state.lock().await;
        *state.balances.entry(owner_id.to_owned()).or_default() += amount;
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn reserve(&self, owner_id: &str, amount: i64) -> Result<ReservationId, PipelineError> {
        let mut state = self.state.lock().await;
        let balance = state.balances.entry(owner_id.to_owned()).or_default();
        if *balance < amount {
            return Err(PipelineError::InsufficientCredits {
                owner_id: owner_id.to_owned(),
                required: amount,
            });
        }
        *balance -= amount;

        let id = Uuid::new_v4();
        state.held.insert(
            id,
            Hold {
                owner_id: owner_id.to_owned(),
                amount,
            },
        );
        Ok(id)
    }

    async fn commit(&self, reservation_id: ReservationId) -> Result<(), PipelineError> {
        let mut state = self.state.lock().await;
        state
            .held
            .remove(&reservation_id)
            .map(|_| ())
            .ok_or(PipelineError::UnknownReservation { reservation_id })
    }

    async fn release(&self, reservation_id: ReservationId) -> Result<(), PipelineError> {
        let mut state = self.state.lock().await;
        let hold = state
            .held
            .remove(&reservation_id)
            .ok_or(PipelineError::UnknownReservation { reservation_id })?;
        *state.balances.entry(hold.owner_id).or_default() += hold.amount;
        Ok(())
    }

    async fn balance(&self, owner_id: &str) -> Result<i64, PipelineError> {
        Ok(self
            .state
            .lock()
            .await
            .balances
            .get(owner_id)
            .copied()
            .unwrap_or(0))
    }
}
