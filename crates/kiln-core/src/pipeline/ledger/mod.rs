//! Credit ledger capability.
//!
//! A reservation holds credits against a user's balance pending job
//! outcome: reserve deducts the balance immediately, commit consumes the
//! hold (the credits are spent), release returns the held credits to the
//! balance. A reservation can be resolved exactly once; commit and release
//! both consume it atomically, so a racing worker and reconciler cannot
//! move the same credits twice.

mod memory;
mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

use async_trait::async_trait;

use crate::pipeline::types::{PipelineError, ReservationId};

#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    /// Place a hold of `amount` credits on `owner_id`'s balance.
    ///
    /// Fails with [`PipelineError::InsufficientCredits`] when the available
    /// balance cannot cover `amount`. Concurrent reserves for the same
    /// owner are serialized; the balance never goes negative.
    async fn reserve(&self, owner_id: &str, amount: i64) -> Result<ReservationId, PipelineError>;

    /// Consume a reservation: the held credits are spent.
    async fn commit(&self, reservation_id: ReservationId) -> Result<(), PipelineError>;

    /// Consume a reservation: the held credits return to the balance.
    async fn release(&self, reservation_id: ReservationId) -> Result<(), PipelineError>;

    /// Current available balance (held credits excluded).
    async fn balance(&self, owner_id: &str) -> Result<i64, PipelineError>;
}
