//! Database migrations for the analysis engine.
//!
//! Schema for job records, analysis progress, consistency issues and the
//! credit ledger, managed with SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_090000_create_jobs;
mod m2026_01_05_090100_add_job_dedup_guard;
mod m2026_01_05_090200_create_analysis_jobs;
mod m2026_01_05_090300_create_analysis_aggregates;
mod m2026_01_05_090400_create_consistency_issues;
mod m2026_01_05_090500_create_credit_ledger;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_090000_create_jobs::Migration),
            Box::new(m2026_01_05_090100_add_job_dedup_guard::Migration),
            Box::new(m2026_01_05_090200_create_analysis_jobs::Migration),
            Box::new(m2026_01_05_090300_create_analysis_aggregates::Migration),
            Box::new(m2026_01_05_090400_create_consistency_issues::Migration),
            Box::new(m2026_01_05_090500_create_credit_ledger::Migration),
        ]
    }
}
