//! Migration to create the consistency_issues table.
//!
//! Issues are append-only findings of the validator; `resolution` stays null
//! until a repair or a re-validation closes them.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ConsistencyIssues::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ConsistencyIssues::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ConsistencyIssues::EntityId).uuid().not_null())
                    .col(
                        ColumnDef::new(ConsistencyIssues::EntityType)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ConsistencyIssues::IssueType).text().not_null())
                    .col(ColumnDef::new(ConsistencyIssues::Details).json_binary().null())
                    .col(
                        ColumnDef::new(ConsistencyIssues::DetectedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(ConsistencyIssues::Resolution).text().null())
                    .col(
                        ColumnDef::new(ConsistencyIssues::ResolvedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_consistency_issues_entity_resolution")
                    .table(ConsistencyIssues::Table)
                    .col(ConsistencyIssues::EntityId)
                    .col(ConsistencyIssues::Resolution)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_consistency_issues_entity_resolution")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ConsistencyIssues::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ConsistencyIssues {
    Table,
    Id,
    EntityId,
    EntityType,
    IssueType,
    Details,
    DetectedAt,
    Resolution,
    ResolvedAt,
}
