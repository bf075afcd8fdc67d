//! Migration to create the credit_balances and credit_reservations tables.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CreditBalances::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CreditBalances::OwnerId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(CreditBalances::Balance)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(CreditBalances::Version)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(CreditBalances::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .check(Expr::col(CreditBalances::Balance).gte(0))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(CreditReservations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CreditReservations::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CreditReservations::OwnerId).uuid().not_null())
                    .col(ColumnDef::new(CreditReservations::JobId).uuid().not_null())
                    .col(
                        ColumnDef::new(CreditReservations::Amount)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CreditReservations::State)
                            .text()
                            .not_null()
                            .default("reserved"),
                    )
                    .col(ColumnDef::new(CreditReservations::SettleReason).text().null())
                    .col(
                        ColumnDef::new(CreditReservations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(CreditReservations::SettledAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_credit_reservations_owner_id")
                            .from(CreditReservations::Table, CreditReservations::OwnerId)
                            .to(CreditBalances::Table, CreditBalances::OwnerId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_credit_reservations_state_created")
                    .table(CreditReservations::Table)
                    .col(CreditReservations::State)
                    .col(CreditReservations::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_credit_reservations_job_id")
                    .table(CreditReservations::Table)
                    .col(CreditReservations::JobId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CreditReservations::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(CreditBalances::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CreditBalances {
    Table,
    OwnerId,
    Balance,
    Version,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum CreditReservations {
    Table,
    Id,
    OwnerId,
    JobId,
    Amount,
    State,
    SettleReason,
    CreatedAt,
    SettledAt,
}
