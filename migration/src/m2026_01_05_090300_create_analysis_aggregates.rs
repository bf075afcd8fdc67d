//! Migration to create the analysis_aggregates table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AnalysisAggregates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AnalysisAggregates::AnalysisJobId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(AnalysisAggregates::UnitCount)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AnalysisAggregates::Summary)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AnalysisAggregates::ComputedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_analysis_aggregates_analysis_job_id")
                            .from(
                                AnalysisAggregates::Table,
                                AnalysisAggregates::AnalysisJobId,
                            )
                            .to(AnalysisJobs::Table, AnalysisJobs::JobId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AnalysisAggregates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AnalysisAggregates {
    Table,
    AnalysisJobId,
    UnitCount,
    Summary,
    ComputedAt,
}

#[derive(DeriveIden)]
enum AnalysisJobs {
    Table,
    JobId,
}
