//! # SyncJob Repository
//!
//! Repository operations for the `sync_jobs` table. The one-active-job-per-
//! license invariant is enforced by a partial unique index; a racing start
//! surfaces as a unique violation and maps to 409.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

use crate::error::{ApiError, internal_db_error, is_unique_violation};
use crate::models::sync_job::{ActiveModel, Column, Entity, Model};
use crate::models::{EntityType, JobDirection, job_status};

/// Repository for sync job database operations
pub struct SyncJobRepository {
    db: DatabaseConnection,
}

impl SyncJobRepository {
    /// Create a new SyncJobRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Start a new sync job for a license.
    ///
    /// Fails with 409 `SYNC_ALREADY_RUNNING` when the license already has a
    /// pending or processing job; the partial unique index closes the race
    /// between concurrent starts.
    pub async fn start_job(
        &self,
        license_id: Uuid,
        direction: JobDirection,
        entity_types: &[EntityType],
    ) -> Result<Model, ApiError> {
        let now = Utc::now().fixed_offset();

        let job = ActiveModel {
            id: Set(Uuid::new_v4()),
            license_id: Set(license_id),
            direction: Set(direction.as_str().to_string()),
            entity_types: Set(json!(
                entity_types.iter().map(|t| t.as_str()).collect::<Vec<_>>()
            )),
            status: Set(job_status::PENDING.to_string()),
            items_enqueued: Set(0),
            items_succeeded: Set(0),
            items_failed: Set(0),
            started_at: Set(None),
            finished_at: Set(None),
            error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match job.insert(&self.db).await {
            Ok(model) => {
                tracing::info!(
                    license_id = %license_id,
                    job_id = %model.id,
                    direction = %model.direction,
                    "Sync job started"
                );
                Ok(model)
            }
            Err(err) if is_unique_violation(&err) => Err(ApiError::new(
                axum::http::StatusCode::CONFLICT,
                "SYNC_ALREADY_RUNNING",
                "A sync job is already running for this license",
            )),
            Err(err) => Err(internal_db_error("Failed to start sync job", err)),
        }
    }

    /// Find a sync job by ID.
    pub async fn find_by_id(&self, job_id: Uuid) -> Result<Option<Model>, ApiError> {
        Entity::find_by_id(job_id)
            .one(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to find sync job", err))
    }

    /// The license's current pending or processing job, if any.
    pub async fn find_active_for_license(
        &self,
        license_id: Uuid,
    ) -> Result<Option<Model>, ApiError> {
        Entity::find()
            .filter(Column::LicenseId.eq(license_id))
            .filter(Column::Status.is_in([job_status::PENDING, job_status::PROCESSING]))
            .one(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to find active sync job", err))
    }

    /// List sync jobs for a license, newest first.
    pub async fn list_by_license(
        &self,
        license_id: Uuid,
        status: Option<String>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Model>, ApiError> {
        let mut query = Entity::find()
            .filter(Column::LicenseId.eq(license_id))
            .order_by_desc(Column::CreatedAt);

        if let Some(status_filter) = status {
            query = query.filter(Column::Status.eq(status_filter));
        }

        query
            .offset(offset.unwrap_or(0))
            .limit(limit.unwrap_or(50))
            .all(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to list sync jobs", err))
    }

    /// Transition a pending job to processing and stamp `started_at`.
    ///
    /// Returns false when the job was no longer pending (e.g. cancelled
    /// between claim and start).
    pub async fn mark_processing(&self, job_id: Uuid) -> Result<bool, ApiError> {
        let now = Utc::now().fixed_offset();
        let result = Entity::update_many()
            .col_expr(Column::Status, job_status::PROCESSING.into())
            .col_expr(Column::StartedAt, now.into())
            .col_expr(Column::UpdatedAt, now.into())
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(job_status::PENDING))
            .exec(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to mark job processing", err))?;

        Ok(result.rows_affected == 1)
    }

    /// Record how many items a run enqueued for this job.
    pub async fn add_enqueued(&self, job_id: Uuid, count: i32) -> Result<(), ApiError> {
        Entity::update_many()
            .col_expr(
                Column::ItemsEnqueued,
                Expr::col(Column::ItemsEnqueued).add(count),
            )
            .col_expr(Column::UpdatedAt, Utc::now().fixed_offset().into())
            .filter(Column::Id.eq(job_id))
            .exec(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to update job item counts", err))?;
        Ok(())
    }

    /// Record one terminal item outcome against the owning job.
    pub async fn record_item_outcome(&self, job_id: Uuid, succeeded: bool) -> Result<(), ApiError> {
        let counter = if succeeded {
            Column::ItemsSucceeded
        } else {
            Column::ItemsFailed
        };

        Entity::update_many()
            .col_expr(counter, Expr::col(counter).add(1))
            .col_expr(Column::UpdatedAt, Utc::now().fixed_offset().into())
            .filter(Column::Id.eq(job_id))
            .exec(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to update job item counts", err))?;
        Ok(())
    }

    /// Transition a job to a terminal status.
    pub async fn finish(
        &self,
        job_id: Uuid,
        status: &str,
        error: Option<JsonValue>,
    ) -> Result<Model, ApiError> {
        let job = self
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| crate::error::not_found("Sync job not found"))?;

        let now = Utc::now().fixed_offset();
        let mut active_job: ActiveModel = job.into();
        active_job.status = Set(status.to_string());
        active_job.finished_at = Set(Some(now));
        active_job.updated_at = Set(now);
        if let Some(err) = error {
            active_job.error = Set(Some(err));
        }

        active_job
            .update(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to finish sync job", err))
    }

    /// Cancel a pending or processing job.
    ///
    /// In-flight items finish their current attempt; remaining pending items
    /// are dead-lettered by the caller. Returns the updated job, or 409 when
    /// the job is already terminal.
    pub async fn cancel(&self, job_id: Uuid, reason: Option<String>) -> Result<Model, ApiError> {
        let job = self
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| crate::error::not_found("Sync job not found"))?;

        if job.status != job_status::PENDING && job.status != job_status::PROCESSING {
            return Err(crate::error::conflict(
                "Sync job is already in a terminal state",
            ));
        }

        let now = Utc::now().fixed_offset();
        let mut active_job: ActiveModel = job.into();
        active_job.status = Set(job_status::CANCELLED.to_string());
        active_job.finished_at = Set(Some(now));
        active_job.updated_at = Set(now);
        if let Some(reason) = reason {
            active_job.error = Set(Some(json!({ "cancelled": reason })));
        }

        let cancelled = active_job
            .update(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to cancel sync job", err))?;

        tracing::info!(job_id = %cancelled.id, "Sync job cancelled");
        Ok(cancelled)
    }
}
