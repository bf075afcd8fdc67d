//! Migration to create the analysis_jobs and analysis_units tables.
//!
//! An analysis job record tracks progress and liveness for a long-running
//! content analysis; each unit row is one item of the batch it processes.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AnalysisJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AnalysisJobs::JobId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AnalysisJobs::OwnerId).uuid().not_null())
                    .col(
                        ColumnDef::new(AnalysisJobs::TargetEntityId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AnalysisJobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(AnalysisJobs::UnitsTotal)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(AnalysisJobs::UnitsDone)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(AnalysisJobs::UnitsFailed)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(AnalysisJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AnalysisJobs::LastHeartbeatAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AnalysisJobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(AnalysisJobs::FailureReason).text().null())
                    .col(
                        ColumnDef::new(AnalysisJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(AnalysisJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_analysis_jobs_job_id")
                            .from(AnalysisJobs::Table, AnalysisJobs::JobId)
                            .to(Jobs::Table, Jobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_analysis_jobs_status_heartbeat")
                    .table(AnalysisJobs::Table)
                    .col(AnalysisJobs::Status)
                    .col(AnalysisJobs::LastHeartbeatAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(AnalysisUnits::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AnalysisUnits::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(AnalysisUnits::AnalysisJobId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AnalysisUnits::UnitKey).text().not_null())
                    .col(ColumnDef::new(AnalysisUnits::Position).integer().not_null())
                    .col(
                        ColumnDef::new(AnalysisUnits::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(AnalysisUnits::Result).json_binary().null())
                    .col(ColumnDef::new(AnalysisUnits::Error).text().null())
                    .col(
                        ColumnDef::new(AnalysisUnits::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AnalysisUnits::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(AnalysisUnits::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_analysis_units_analysis_job_id")
                            .from(AnalysisUnits::Table, AnalysisUnits::AnalysisJobId)
                            .to(AnalysisJobs::Table, AnalysisJobs::JobId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_analysis_units_job_key")
                    .table(AnalysisUnits::Table)
                    .col(AnalysisUnits::AnalysisJobId)
                    .col(AnalysisUnits::UnitKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AnalysisUnits::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(AnalysisJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AnalysisJobs {
    Table,
    JobId,
    OwnerId,
    TargetEntityId,
    Status,
    UnitsTotal,
    UnitsDone,
    UnitsFailed,
    StartedAt,
    LastHeartbeatAt,
    CompletedAt,
    FailureReason,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum AnalysisUnits {
    Table,
    Id,
    AnalysisJobId,
    UnitKey,
    Position,
    Status,
    Result,
    Error,
    ProcessedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
}
