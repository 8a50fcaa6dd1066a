//! # Dead-Letter Repository
//!
//! Repository operations over permanently failed queue items. Items leave
//! the dead letter only through a manual retry (reset to pending with a
//! fresh attempt budget) or a dismissal with operator notes; both paths are
//! audited by the caller.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use uuid::Uuid;

use crate::error::{ApiError, internal_db_error};
use crate::models::item_status;
use crate::models::queue_item::{ActiveModel, Column, Entity, Model};

/// Filters accepted when listing dead-lettered items.
#[derive(Default)]
pub struct DeadLetterFilter {
    pub license_id: Option<Uuid>,
    pub entity_type: Option<String>,
    pub error_code: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Repository for dead-letter operations on queue items
pub struct DeadLetterRepository {
    db: DatabaseConnection,
}

impl DeadLetterRepository {
    /// Create a new DeadLetterRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// List permanently failed items, newest failures first.
    pub async fn list(&self, filter: DeadLetterFilter) -> Result<Vec<Model>, ApiError> {
        let mut query = Entity::find()
            .filter(Column::Status.eq(item_status::FAILED_PERMANENT))
            .order_by_desc(Column::FailedAt);

        if let Some(license_id) = filter.license_id {
            query = query.filter(Column::LicenseId.eq(license_id));
        }
        if let Some(entity_type) = filter.entity_type {
            query = query.filter(Column::EntityType.eq(entity_type));
        }
        if let Some(error_code) = filter.error_code {
            query = query.filter(Column::LastErrorCode.eq(error_code));
        }

        query
            .offset(filter.offset.unwrap_or(0))
            .limit(filter.limit.unwrap_or(50))
            .all(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to list dead-letter items", err))
    }

    /// Count of dead-lettered items for a license.
    pub async fn count_for_license(&self, license_id: Uuid) -> Result<u64, ApiError> {
        Entity::find()
            .filter(Column::LicenseId.eq(license_id))
            .filter(Column::Status.eq(item_status::FAILED_PERMANENT))
            .count(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to count dead-letter items", err))
    }

    async fn has_live_duplicate(&self, idempotency_key: &str) -> Result<bool, ApiError> {
        Entity::find()
            .filter(Column::IdempotencyKey.eq(idempotency_key))
            .filter(Column::Status.is_in(item_status::LIVE))
            .count(&self.db)
            .await
            .map(|count| count > 0)
            .map_err(|err| internal_db_error("Failed to check for live duplicates", err))
    }

    /// Re-enqueue one dead-lettered item with a fresh attempt budget.
    ///
    /// Returns 409 when the item is not in the dead letter (already retried
    /// or dismissed), or when a newer live item for the same change exists;
    /// resetting the old row beside it would break the live-key guarantee.
    pub async fn retry(&self, item_id: Uuid) -> Result<Model, ApiError> {
        let item = Entity::find_by_id(item_id)
            .one(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to find dead-letter item", err))?
            .ok_or_else(|| crate::error::not_found("Queue item not found"))?;

        if item.status != item_status::FAILED_PERMANENT {
            return Err(crate::error::conflict(
                "Queue item is not in the dead letter",
            ));
        }
        if self.has_live_duplicate(&item.idempotency_key).await? {
            return Err(crate::error::conflict(
                "A live queue item for this change already exists",
            ));
        }

        let now = Utc::now().fixed_offset();
        let mut active: ActiveModel = item.into();
        active.status = Set(item_status::PENDING.to_string());
        active.attempts = Set(0);
        active.scheduled_at = Set(now);
        active.failed_at = Set(None);
        active.updated_at = Set(now);

        active
            .update(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to retry dead-letter item", err))
    }

    /// Re-enqueue every dead-lettered item for a license. Items whose
    /// change already has a newer live item are skipped. Returns the items
    /// that were reset, for auditing.
    pub async fn retry_all(&self, license_id: Uuid) -> Result<Vec<Model>, ApiError> {
        let targets = Entity::find()
            .filter(Column::LicenseId.eq(license_id))
            .filter(Column::Status.eq(item_status::FAILED_PERMANENT))
            .all(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to list dead-letter items", err))?;

        let mut ids = Vec::with_capacity(targets.len());
        for target in &targets {
            if !self.has_live_duplicate(&target.idempotency_key).await? {
                ids.push(target.id);
            }
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now().fixed_offset();
        Entity::update_many()
            .col_expr(Column::Status, item_status::PENDING.into())
            .col_expr(Column::Attempts, 0.into())
            .col_expr(Column::ScheduledAt, now.into())
            .col_expr(Column::FailedAt, sea_orm::Value::ChronoDateTimeWithTimeZone(None).into())
            .col_expr(Column::UpdatedAt, now.into())
            .filter(Column::Id.is_in(ids.clone()))
            .filter(Column::Status.eq(item_status::FAILED_PERMANENT))
            .exec(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to retry dead-letter items", err))?;

        Entity::find()
            .filter(Column::Id.is_in(ids))
            .all(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to reload retried items", err))
    }

    /// Dismiss one dead-lettered item with operator notes.
    ///
    /// Dismissal acknowledges the divergence without resolving it; the row
    /// stays behind as part of the audit trail.
    pub async fn dismiss(&self, item_id: Uuid, notes: String) -> Result<Model, ApiError> {
        let item = Entity::find_by_id(item_id)
            .one(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to find dead-letter item", err))?
            .ok_or_else(|| crate::error::not_found("Queue item not found"))?;

        if item.status != item_status::FAILED_PERMANENT {
            return Err(crate::error::conflict(
                "Queue item is not in the dead letter",
            ));
        }

        let mut active: ActiveModel = item.into();
        active.status = Set(item_status::DISMISSED.to_string());
        active.dismiss_notes = Set(Some(notes));
        active.updated_at = Set(Utc::now().fixed_offset());

        active
            .update(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to dismiss dead-letter item", err))
    }
}
