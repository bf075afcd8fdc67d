//! # ConsistencyIssue Repository
//!
//! Append-only findings of the consistency validator. At most one open issue
//! of a given type exists per entity; recording it again returns the open one.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::consistency_issue::{
    ActiveModel, Column, ENTITY_ANALYSIS_JOB, Entity, IssueType, Model,
};

/// Repository for consistency issue database operations
#[derive(Clone)]
pub struct ConsistencyIssueRepository {
    db: DatabaseConnection,
}

impl ConsistencyIssueRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Record an open issue for an analysis unless one of the same type is already open.
    /// Returns the issue and whether it was newly created.
    pub async fn record(
        &self,
        entity_id: Uuid,
        issue_type: IssueType,
        details: Option<JsonValue>,
    ) -> Result<(Model, bool), DbErr> {
        let existing = Entity::find()
            .filter(Column::EntityId.eq(entity_id))
            .filter(Column::IssueType.eq(issue_type.as_str()))
            .filter(Column::Resolution.is_null())
            .one(&self.db)
            .await?;
        if let Some(existing) = existing {
            return Ok((existing, false));
        }

        let issue = ActiveModel {
            id: Set(Uuid::new_v4()),
            entity_id: Set(entity_id),
            entity_type: Set(ENTITY_ANALYSIS_JOB.to_string()),
            issue_type: Set(issue_type.as_str().to_string()),
            details: Set(details),
            detected_at: Set(Utc::now().fixed_offset()),
            resolution: Set(None),
            resolved_at: Set(None),
        }
        .insert(&self.db)
        .await?;

        tracing::warn!(
            entity_id = %entity_id,
            issue_type = %issue_type,
            issue_id = %issue.id,
            "Consistency issue recorded"
        );
        Ok((issue, true))
    }

    pub async fn find_by_id(&self, issue_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(issue_id).one(&self.db).await
    }

    pub async fn open_for_entity(&self, entity_id: Uuid) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::EntityId.eq(entity_id))
            .filter(Column::Resolution.is_null())
            .order_by_asc(Column::DetectedAt)
            .all(&self.db)
            .await
    }

    pub async fn has_open(&self, entity_id: Uuid) -> Result<bool, DbErr> {
        let open = Entity::find()
            .filter(Column::EntityId.eq(entity_id))
            .filter(Column::Resolution.is_null())
            .count(&self.db)
            .await?;
        Ok(open > 0)
    }

    /// Entity ids with at least one open issue, oldest detection first.
    pub async fn open_entity_ids(&self, limit: u64) -> Result<Vec<Uuid>, DbErr> {
        let issues = Entity::find()
            .filter(Column::Resolution.is_null())
            .order_by_asc(Column::DetectedAt)
            .limit(limit)
            .all(&self.db)
            .await?;

        let mut ids: Vec<Uuid> = Vec::with_capacity(issues.len());
        for issue in issues {
            if !ids.contains(&issue.entity_id) {
                ids.push(issue.entity_id);
            }
        }
        Ok(ids)
    }

    /// List issues, newest first, optionally only the open ones.
    pub async fn list(&self, open_only: bool, limit: u64) -> Result<Vec<Model>, DbErr> {
        let mut query = Entity::find();
        if open_only {
            query = query.filter(Column::Resolution.is_null());
        }
        query
            .order_by_desc(Column::DetectedAt)
            .order_by_asc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await
    }

    pub async fn count_open(&self) -> Result<u64, DbErr> {
        Entity::find()
            .filter(Column::Resolution.is_null())
            .count(&self.db)
            .await
    }

    /// Close every open issue of an entity. Returns how many were closed.
    pub async fn resolve_for_entity(&self, entity_id: Uuid, resolution: &str) -> Result<u64, DbErr> {
        let resolved = Entity::update_many()
            .col_expr(Column::Resolution, Expr::value(resolution))
            .col_expr(Column::ResolvedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::EntityId.eq(entity_id))
            .filter(Column::Resolution.is_null())
            .exec(&self.db)
            .await?;
        Ok(resolved.rows_affected)
    }
}
