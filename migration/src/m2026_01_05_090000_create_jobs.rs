//! Migration to create the jobs table.
//!
//! Every schedulable unit of work is persisted here with its priority, retry
//! budget, heartbeat and terminal state so the in-memory queue can be rebuilt
//! after a restart.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Jobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Jobs::OwnerId).uuid().not_null())
                    .col(ColumnDef::new(Jobs::Kind).text().not_null())
                    .col(ColumnDef::new(Jobs::Payload).json_binary().not_null())
                    .col(ColumnDef::new(Jobs::DedupKey).text().not_null())
                    .col(
                        ColumnDef::new(Jobs::Priority)
                            .small_integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Jobs::State)
                            .text()
                            .not_null()
                            .default("queued"),
                    )
                    .col(
                        ColumnDef::new(Jobs::AttemptCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Jobs::MaxAttempts).integer().not_null())
                    .col(ColumnDef::new(Jobs::Cost).big_integer().not_null().default(0))
                    .col(ColumnDef::new(Jobs::ReservationId).uuid().null())
                    .col(
                        ColumnDef::new(Jobs::EnqueuedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Jobs::RetryAfter)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Jobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Jobs::LastHeartbeatAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Jobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Jobs::Error).text().null())
                    .col(
                        ColumnDef::new(Jobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Jobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Recovery scan on startup reads queued jobs by priority then age
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_jobs_state_priority_enqueued ON jobs (state, priority DESC, enqueued_at)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_state_heartbeat")
                    .table(Jobs::Table)
                    .col(Jobs::State)
                    .col(Jobs::LastHeartbeatAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_owner_created")
                    .table(Jobs::Table)
                    .col(Jobs::OwnerId)
                    .col(Jobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_jobs_state_priority_enqueued")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_jobs_state_heartbeat").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_jobs_owner_created").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
    OwnerId,
    Kind,
    Payload,
    DedupKey,
    Priority,
    State,
    AttemptCount,
    MaxAttempts,
    Cost,
    ReservationId,
    EnqueuedAt,
    RetryAfter,
    StartedAt,
    LastHeartbeatAt,
    CompletedAt,
    Error,
    CreatedAt,
    UpdatedAt,
}
