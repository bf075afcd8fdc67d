//! # Job Repository
//!
//! Read-side queries over the `jobs` table for listing and operator views.
//! State transitions live in the lifecycle tracker, not here.

use std::collections::BTreeMap;

use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};
use uuid::Uuid;

use crate::models::JobState;
use crate::models::job::{Column, Entity, Model};

/// Filters for listing jobs
#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    pub owner_id: Option<Uuid>,
    pub state: Option<JobState>,
    pub kind: Option<String>,
    pub limit: u64,
}

/// Repository for job read operations
#[derive(Clone)]
pub struct JobRepository {
    db: DatabaseConnection,
}

impl JobRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, job_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(job_id).one(&self.db).await
    }

    /// The queued or running job holding a payload identity, if any.
    pub async fn find_active_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::DedupKey.eq(dedup_key))
            .filter(Column::State.is_in([JobState::Queued.as_str(), JobState::Running.as_str()]))
            .one(&self.db)
            .await
    }

    /// List jobs newest first
    pub async fn list(&self, filter: &JobListFilter) -> Result<Vec<Model>, DbErr> {
        let mut query = Entity::find();

        if let Some(owner_id) = filter.owner_id {
            query = query.filter(Column::OwnerId.eq(owner_id));
        }
        if let Some(state) = filter.state {
            query = query.filter(Column::State.eq(state.as_str()));
        }
        if let Some(kind) = &filter.kind {
            query = query.filter(Column::Kind.eq(kind.as_str()));
        }

        query
            .order_by_desc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .limit(filter.limit)
            .all(&self.db)
            .await
    }

    /// Number of jobs per state; states without jobs are reported as zero.
    pub async fn count_by_state(&self) -> Result<BTreeMap<String, i64>, DbErr> {
        let rows: Vec<(String, i64)> = Entity::find()
            .select_only()
            .column(Column::State)
            .column_as(Column::Id.count(), "count")
            .group_by(Column::State)
            .into_tuple()
            .all(&self.db)
            .await?;

        let mut counts: BTreeMap<String, i64> = [
            JobState::Queued,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Repairing,
        ]
        .iter()
        .map(|state| (state.as_str().to_string(), 0))
        .collect();
        for (state, count) in rows {
            counts.insert(state, count);
        }
        Ok(counts)
    }
}
