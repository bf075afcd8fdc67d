//! # Credit Gate
//!
//! Reserve, then commit or refund. Every balance mutation in the service goes
//! through this module, and each runs as a single guarded statement inside a
//! transaction:
//!
//! - `reserve` debits with `balance = balance - amount WHERE balance >= amount`,
//!   so two concurrent reservations can never both succeed against insufficient
//!   funds.
//! - `commit` and `refund` flip the reservation with a compare-and-swap on
//!   `state = 'reserved'`; a replay finds zero affected rows and is a no-op.

use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, QueryTrait, Set, TransactionTrait,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::models::credit_balance::{
    ActiveModel as BalanceActiveModel, Column as BalanceColumn, Entity as CreditBalance,
    Model as BalanceModel,
};
use crate::models::credit_reservation::{
    ActiveModel as ReservationActiveModel, Column as ReservationColumn, Entity as CreditReservation,
    Model as ReservationModel,
};
use crate::models::job::{Column as JobColumn, Entity as Job};
use crate::models::{JobState, ReservationState};

#[derive(Debug, Error)]
pub enum CreditError {
    #[error("insufficient credits for {owner_id}: requested {requested}, available {available}")]
    InsufficientCredits {
        owner_id: Uuid,
        requested: i64,
        available: i64,
    },
    #[error("credit amount must be positive, got {amount}")]
    InvalidAmount { amount: i64 },
    #[error("no credit account for owner {owner_id}")]
    AccountNotFound { owner_id: Uuid },
    #[error("reservation {reservation_id} not found")]
    ReservationNotFound { reservation_id: Uuid },
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

/// Reservations settled by one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiredSettlement {
    /// Job succeeded but the commit never landed
    pub committed: Vec<Uuid>,
    /// Job failed, vanished or never got persisted
    pub refunded: Vec<Uuid>,
}

/// Result of a commit or refund call.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub reservation: ReservationModel,
    /// False when the reservation had already been settled and the call was a no-op.
    pub applied: bool,
}

#[derive(Clone)]
pub struct CreditGate {
    db: DatabaseConnection,
}

impl CreditGate {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Top up an owner's balance, creating the account on first deposit.
    #[instrument(skip(self), fields(owner_id = %owner_id, amount))]
    pub async fn deposit(&self, owner_id: Uuid, amount: i64) -> Result<BalanceModel, CreditError> {
        if amount <= 0 {
            return Err(CreditError::InvalidAmount { amount });
        }

        let txn = self.db.begin().await?;
        let now = Utc::now().fixed_offset();

        let updated = CreditBalance::update_many()
            .col_expr(
                BalanceColumn::Balance,
                Expr::col(BalanceColumn::Balance).add(amount),
            )
            .col_expr(
                BalanceColumn::Version,
                Expr::col(BalanceColumn::Version).add(1),
            )
            .col_expr(BalanceColumn::UpdatedAt, Expr::value(now))
            .filter(BalanceColumn::OwnerId.eq(owner_id))
            .exec(&txn)
            .await?;

        if updated.rows_affected == 0 {
            BalanceActiveModel {
                owner_id: Set(owner_id),
                balance: Set(amount),
                version: Set(0),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        let account = load_account(&txn, owner_id).await?;
        txn.commit().await?;

        info!(balance = account.balance, "Credits deposited");
        Ok(account)
    }

    pub async fn balance(&self, owner_id: Uuid) -> Result<BalanceModel, CreditError> {
        load_account(&self.db, owner_id).await
    }

    /// Atomically check and debit `amount`, recording a `reserved` hold for `job_id`.
    #[instrument(skip(self), fields(owner_id = %owner_id, job_id = %job_id, amount))]
    pub async fn reserve(
        &self,
        owner_id: Uuid,
        job_id: Uuid,
        amount: i64,
    ) -> Result<ReservationModel, CreditError> {
        if amount <= 0 {
            return Err(CreditError::InvalidAmount { amount });
        }

        let txn = self.db.begin().await?;
        let now = Utc::now().fixed_offset();

        let debited = CreditBalance::update_many()
            .col_expr(
                BalanceColumn::Balance,
                Expr::col(BalanceColumn::Balance).sub(amount),
            )
            .col_expr(
                BalanceColumn::Version,
                Expr::col(BalanceColumn::Version).add(1),
            )
            .col_expr(BalanceColumn::UpdatedAt, Expr::value(now))
            .filter(BalanceColumn::OwnerId.eq(owner_id))
            .filter(BalanceColumn::Balance.gte(amount))
            .exec(&txn)
            .await?;

        if debited.rows_affected == 0 {
            let available = CreditBalance::find_by_id(owner_id)
                .one(&txn)
                .await?
                .map(|account| account.balance)
                .unwrap_or(0);
            txn.rollback().await?;
            counter!("engine_credit_reservations_total", "outcome" => "insufficient").increment(1);
            return Err(CreditError::InsufficientCredits {
                owner_id,
                requested: amount,
                available,
            });
        }

        let reservation = ReservationActiveModel {
            id: Set(Uuid::new_v4()),
            owner_id: Set(owner_id),
            job_id: Set(job_id),
            amount: Set(amount),
            state: Set(ReservationState::Reserved.as_str().to_string()),
            settle_reason: Set(None),
            created_at: Set(now),
            settled_at: Set(None),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;

        counter!("engine_credit_reservations_total", "outcome" => "reserved").increment(1);
        debug!(reservation_id = %reservation.id, "Credits reserved");
        Ok(reservation)
    }

    /// Reserved to Committed. A no-op on an already settled reservation.
    #[instrument(skip(self), fields(reservation_id = %reservation_id))]
    pub async fn commit(&self, reservation_id: Uuid) -> Result<Settlement, CreditError> {
        let now = Utc::now().fixed_offset();
        let flipped = CreditReservation::update_many()
            .col_expr(
                ReservationColumn::State,
                Expr::value(ReservationState::Committed.as_str()),
            )
            .col_expr(ReservationColumn::SettleReason, Expr::value("job succeeded"))
            .col_expr(ReservationColumn::SettledAt, Expr::value(now))
            .filter(ReservationColumn::Id.eq(reservation_id))
            .filter(ReservationColumn::State.eq(ReservationState::Reserved.as_str()))
            .exec(&self.db)
            .await?;

        let reservation = load_reservation(&self.db, reservation_id).await?;
        let applied = flipped.rows_affected == 1;
        if applied {
            debug!(amount = reservation.amount, "Reservation committed");
        } else {
            debug!(state = %reservation.state, "Commit ignored; reservation already settled");
        }
        Ok(Settlement {
            reservation,
            applied,
        })
    }

    /// Reserved to Refunded, restoring the held amount in the same transaction. A no-op on an
    /// already settled reservation.
    #[instrument(skip(self), fields(reservation_id = %reservation_id, reason))]
    pub async fn refund(
        &self,
        reservation_id: Uuid,
        reason: &str,
    ) -> Result<Settlement, CreditError> {
        let txn = self.db.begin().await?;
        let now = Utc::now().fixed_offset();

        let flipped = CreditReservation::update_many()
            .col_expr(
                ReservationColumn::State,
                Expr::value(ReservationState::Refunded.as_str()),
            )
            .col_expr(ReservationColumn::SettleReason, Expr::value(reason))
            .col_expr(ReservationColumn::SettledAt, Expr::value(now))
            .filter(ReservationColumn::Id.eq(reservation_id))
            .filter(ReservationColumn::State.eq(ReservationState::Reserved.as_str()))
            .exec(&txn)
            .await?;

        let reservation = load_reservation(&txn, reservation_id).await?;
        let applied = flipped.rows_affected == 1;

        if applied {
            CreditBalance::update_many()
                .col_expr(
                    BalanceColumn::Balance,
                    Expr::col(BalanceColumn::Balance).add(reservation.amount),
                )
                .col_expr(
                    BalanceColumn::Version,
                    Expr::col(BalanceColumn::Version).add(1),
                )
                .col_expr(BalanceColumn::UpdatedAt, Expr::value(now))
                .filter(BalanceColumn::OwnerId.eq(reservation.owner_id))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;

        if applied {
            counter!("engine_credit_refunds_total").increment(1);
            info!(
                owner_id = %reservation.owner_id,
                amount = reservation.amount,
                "Reservation refunded"
            );
        } else {
            debug!(state = %reservation.state, "Refund ignored; reservation already settled");
        }
        Ok(Settlement {
            reservation,
            applied,
        })
    }

    /// Settle a reservation from the current state of its job: commit once the job succeeded,
    /// refund once it failed or no longer exists. Returns `None` and leaves the hold in place
    /// while the job is still queued or running.
    #[instrument(skip(self), fields(reservation_id = %reservation_id, job_id = %job_id, reason))]
    pub async fn settle_for_job(
        &self,
        reservation_id: Uuid,
        job_id: Uuid,
        reason: &str,
    ) -> Result<Option<Settlement>, CreditError> {
        let state: Option<String> = Job::find_by_id(job_id)
            .select_only()
            .column(JobColumn::State)
            .into_tuple()
            .one(&self.db)
            .await?;

        match state.as_deref().and_then(|state| state.parse::<JobState>().ok()) {
            Some(JobState::Queued | JobState::Running) => Ok(None),
            Some(JobState::Succeeded | JobState::Repairing) => {
                self.commit(reservation_id).await.map(Some)
            }
            Some(JobState::Failed) | None => self.refund(reservation_id, reason).await.map(Some),
        }
    }

    /// Settle reservations still `reserved` after `ttl` whose job is no longer active. Holds of
    /// queued or running jobs are kept: the job settles them itself, or the hang sweep fails it.
    #[instrument(skip(self))]
    pub async fn settle_expired(
        &self,
        ttl: Duration,
        limit: u64,
    ) -> Result<ExpiredSettlement, CreditError> {
        let cutoff = cutoff_before(ttl);
        let active_jobs = Job::find()
            .select_only()
            .column(JobColumn::Id)
            .filter(
                JobColumn::State.is_in([JobState::Queued.as_str(), JobState::Running.as_str()]),
            )
            .into_query();

        let expired: Vec<(Uuid, Uuid)> = CreditReservation::find()
            .select_only()
            .column(ReservationColumn::Id)
            .column(ReservationColumn::JobId)
            .filter(ReservationColumn::State.eq(ReservationState::Reserved.as_str()))
            .filter(ReservationColumn::CreatedAt.lt(cutoff))
            .filter(ReservationColumn::JobId.not_in_subquery(active_jobs))
            .order_by_asc(ReservationColumn::CreatedAt)
            .limit(limit)
            .into_tuple()
            .all(&self.db)
            .await?;

        let mut settled = ExpiredSettlement::default();
        for (reservation_id, job_id) in expired {
            let Some(settlement) = self
                .settle_for_job(reservation_id, job_id, "reservation ttl expired")
                .await?
            else {
                continue;
            };
            if !settlement.applied {
                continue;
            }
            match settlement.reservation.reservation_state() {
                Some(ReservationState::Committed) => {
                    warn!(reservation_id = %reservation_id, "Committed reservation of a finished job");
                    settled.committed.push(reservation_id);
                }
                _ => {
                    warn!(reservation_id = %reservation_id, "Force-refunded leaked reservation");
                    settled.refunded.push(reservation_id);
                }
            }
        }
        Ok(settled)
    }

    pub async fn get_reservation(
        &self,
        reservation_id: Uuid,
    ) -> Result<ReservationModel, CreditError> {
        load_reservation(&self.db, reservation_id).await
    }

    pub async fn reservation_for_job(
        &self,
        job_id: Uuid,
    ) -> Result<Option<ReservationModel>, CreditError> {
        Ok(CreditReservation::find()
            .filter(ReservationColumn::JobId.eq(job_id))
            .order_by_desc(ReservationColumn::CreatedAt)
            .one(&self.db)
            .await?)
    }
}

/// `now - age`, saturating at the Unix epoch.
pub(crate) fn cutoff_before(age: Duration) -> chrono::DateTime<chrono::FixedOffset> {
    let now = Utc::now();
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(chrono::DateTime::<Utc>::UNIX_EPOCH)
        .fixed_offset()
}

async fn load_account<C: ConnectionTrait>(
    conn: &C,
    owner_id: Uuid,
) -> Result<BalanceModel, CreditError> {
    CreditBalance::find_by_id(owner_id)
        .one(conn)
        .await?
        .ok_or(CreditError::AccountNotFound { owner_id })
}

async fn load_reservation<C: ConnectionTrait>(
    conn: &C,
    reservation_id: Uuid,
) -> Result<ReservationModel, CreditError> {
    CreditReservation::find_by_id(reservation_id)
        .one(conn)
        .await?
        .ok_or(CreditError::ReservationNotFound { reservation_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn gate() -> CreditGate {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        CreditGate::new(db)
    }

    #[tokio::test]
    async fn reserve_debits_and_rejects_overdraw() {
        let gate = gate().await;
        let owner = Uuid::new_v4();
        gate.deposit(owner, 100).await.unwrap();

        gate.reserve(owner, Uuid::new_v4(), 70).await.unwrap();
        let err = gate.reserve(owner, Uuid::new_v4(), 70).await.unwrap_err();

        assert!(matches!(
            err,
            CreditError::InsufficientCredits {
                requested: 70,
                available: 30,
                ..
            }
        ));
        assert_eq!(gate.balance(owner).await.unwrap().balance, 30);
    }

    #[tokio::test]
    async fn reserve_without_account_is_insufficient() {
        let gate = gate().await;
        let err = gate
            .reserve(Uuid::new_v4(), Uuid::new_v4(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CreditError::InsufficientCredits { available: 0, .. }
        ));
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let gate = gate().await;
        let owner = Uuid::new_v4();
        assert!(matches!(
            gate.deposit(owner, 0).await,
            Err(CreditError::InvalidAmount { amount: 0 })
        ));
        assert!(matches!(
            gate.reserve(owner, Uuid::new_v4(), -5).await,
            Err(CreditError::InvalidAmount { amount: -5 })
        ));
    }

    #[tokio::test]
    async fn commit_then_refund_keeps_the_first_settlement() {
        let gate = gate().await;
        let owner = Uuid::new_v4();
        gate.deposit(owner, 50).await.unwrap();
        let reservation = gate.reserve(owner, Uuid::new_v4(), 20).await.unwrap();

        assert!(gate.commit(reservation.id).await.unwrap().applied);
        let replay = gate.refund(reservation.id, "late failure").await.unwrap();

        assert!(!replay.applied);
        assert_eq!(
            replay.reservation.reservation_state(),
            Some(ReservationState::Committed)
        );
        assert_eq!(gate.balance(owner).await.unwrap().balance, 30);
    }

    #[tokio::test]
    async fn refund_restores_balance_once() {
        let gate = gate().await;
        let owner = Uuid::new_v4();
        gate.deposit(owner, 100).await.unwrap();
        let reservation = gate.reserve(owner, Uuid::new_v4(), 100).await.unwrap();
        assert_eq!(gate.balance(owner).await.unwrap().balance, 0);

        assert!(gate.refund(reservation.id, "job failed").await.unwrap().applied);
        assert!(!gate.refund(reservation.id, "job failed").await.unwrap().applied);
        assert!(!gate.commit(reservation.id).await.unwrap().applied);

        assert_eq!(gate.balance(owner).await.unwrap().balance, 100);
        let stored = gate.get_reservation(reservation.id).await.unwrap();
        assert_eq!(stored.reservation_state(), Some(ReservationState::Refunded));
        assert_eq!(stored.amount, 100);
    }

    #[tokio::test]
    async fn unknown_reservation_is_reported() {
        let gate = gate().await;
        let missing = Uuid::new_v4();
        assert!(matches!(
            gate.commit(missing).await,
            Err(CreditError::ReservationNotFound { reservation_id }) if reservation_id == missing
        ));
    }

    #[tokio::test]
    async fn expired_reservation_without_a_job_is_force_refunded() {
        let gate = gate().await;
        let owner = Uuid::new_v4();
        gate.deposit(owner, 10).await.unwrap();
        let reservation = gate.reserve(owner, Uuid::new_v4(), 10).await.unwrap();

        assert_eq!(
            gate.settle_expired(Duration::from_secs(3600), 100)
                .await
                .unwrap(),
            ExpiredSettlement::default()
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        let settled = gate
            .settle_expired(Duration::from_millis(1), 100)
            .await
            .unwrap();
        assert_eq!(settled.refunded, vec![reservation.id]);
        assert!(settled.committed.is_empty());
        assert_eq!(gate.balance(owner).await.unwrap().balance, 10);
    }
}
