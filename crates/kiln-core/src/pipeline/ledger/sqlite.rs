//! SQLite implementation of [`Ledger`].
//!
//! Uses [`sqlx`] with the `sqlite` feature. The conditional debit in
//! [`SqliteLedger::reserve`] serializes concurrent reserves for the same
//! owner at the database level: only an account whose balance still covers
//! the amount is updated, so the balance never goes negative.
//!
//! The migrations directory is shared with the job store; whichever side
//! connects first runs the pending migrations.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::Ledger;
use crate::pipeline::store::MIGRATOR;
use crate::pipeline::types::{PipelineError, ReservationId};

/// SQLite-backed credit ledger.
#[derive(Clone, Debug)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open (or create) the SQLite database at `url` and run pending
    /// migrations.
    pub async fn connect(url: &str) -> Result<Self, PipelineError> {
        let pool = SqlitePool::connect(url).await?;
        Self::from_pool(pool).await
    }

    /// Reuse an existing pool (typically the job store's) and run pending
    /// migrations, which is a no-op if the store connected first.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, PipelineError> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| PipelineError::Store(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Add credits to an account, creating it if needed.
    pub async fn credit(&self, owner_id: &str, amount: i64) -> Result<(), PipelineError> {
        sqlx::query(
            "INSERT INTO accounts (owner_id, balance) VALUES (?1, ?2) \
             ON CONFLICT(owner_id) DO UPDATE SET balance = balance + ?2",
        )
        .bind(owner_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn reserve(&self, owner_id: &str, amount: i64) -> Result<ReservationId, PipelineError> {
        let mut tx = self.pool.begin().await?;

        // Debit only if the balance still covers the amount. An unknown
        // owner matches zero rows and reads as insufficient credits;
        // accounts exist once funded.
        let debited =
            sqlx::query("UPDATE accounts SET balance = balance - ?1 WHERE owner_id = ?2 AND balance >= ?1")
                .bind(amount)
                .bind(owner_id)
                .execute(&mut *tx)
                .await?;
        if debited.rows_affected() == 0 {
            return Err(PipelineError::InsufficientCredits {
                owner_id: owner_id.to_owned(),
                required: amount,
            });
        }

        let id = Uuid::new_v4();
        let created_at = chrono::Utc::now().to_rfc3339();
        sqlx::query("INSERT INTO reservations (id, owner_id, amount, created_at) VALUES (?1, ?2, ?3, ?4)")
            .bind(id.to_string())
            .bind(owner_id)
            .bind(amount)
            .bind(&created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    async fn commit(&self, reservation_id: ReservationId) -> Result<(), PipelineError> {
        // The hold was already debited at reserve time; consuming the row
        // is the whole commit.
        let deleted = sqlx::query("DELETE FROM reservations WHERE id = ?1")
            .bind(reservation_id.to_string())
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(PipelineError::UnknownReservation { reservation_id });
        }
        Ok(())
    }

    async fn release(&self, reservation_id: ReservationId) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT owner_id, amount FROM reservations WHERE id = ?1")
                .bind(reservation_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((owner_id, amount)) = row else {
            return Err(PipelineError::UnknownReservation { reservation_id });
        };

        sqlx::query("DELETE FROM reservations WHERE id = ?1")
            .bind(reservation_id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE accounts SET balance = balance + ?1 WHERE owner_id = ?2")
            .bind(amount)
            .bind(&owner_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn balance(&self, owner_id: &str) -> Result<i64, PipelineError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT balance FROM accounts WHERE owner_id = ?1")
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(balance,)| balance).unwrap_or(0))
    }
}
