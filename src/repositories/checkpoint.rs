//! # Checkpoint Repository
//!
//! Repository operations for the `sync_checkpoints` table. One row per
//! (license, entity type, direction) tuple, upserted on conflict. Cursor
//! writes are linearized by the owning drive loop.

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use crate::error::{ApiError, internal_db_error};
use crate::models::sync_checkpoint::{ActiveModel, Column, Entity, Model};
use crate::models::{Direction, EntityType};
use crate::registry::Cursor;

/// Repository for sync checkpoint database operations
pub struct CheckpointRepository {
    db: DatabaseConnection,
}

impl CheckpointRepository {
    /// Create a new CheckpointRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Load the checkpoint for one tuple, if any.
    pub async fn get(
        &self,
        license_id: Uuid,
        entity_type: EntityType,
        direction: Direction,
    ) -> Result<Option<Model>, ApiError> {
        Entity::find()
            .filter(Column::LicenseId.eq(license_id))
            .filter(Column::EntityType.eq(entity_type.as_str()))
            .filter(Column::Direction.eq(direction.as_str()))
            .one(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to load checkpoint", err))
    }

    /// The stored cursor for one tuple, if any.
    pub async fn cursor(
        &self,
        license_id: Uuid,
        entity_type: EntityType,
        direction: Direction,
    ) -> Result<Option<Cursor>, ApiError> {
        Ok(self
            .get(license_id, entity_type, direction)
            .await?
            .and_then(|checkpoint| checkpoint.cursor)
            .map(Cursor::from_json))
    }

    /// Upsert the checkpoint for one tuple.
    ///
    /// `cursor = None` preserves the stored cursor and only stamps the run
    /// metadata, so a failed run never regresses progress.
    pub async fn upsert(
        &self,
        license_id: Uuid,
        entity_type: EntityType,
        direction: Direction,
        cursor: Option<&Cursor>,
        last_status: &str,
    ) -> Result<(), ApiError> {
        let now = Utc::now().fixed_offset();

        let mut update_columns = vec![Column::LastRunAt, Column::LastStatus, Column::UpdatedAt];
        if cursor.is_some() {
            update_columns.push(Column::Cursor);
        }

        let checkpoint = ActiveModel {
            id: Set(Uuid::new_v4()),
            license_id: Set(license_id),
            entity_type: Set(entity_type.as_str().to_string()),
            direction: Set(direction.as_str().to_string()),
            cursor: Set(cursor.map(|c| c.as_json().clone())),
            last_run_at: Set(Some(now)),
            last_status: Set(Some(last_status.to_string())),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Entity::insert(checkpoint)
            .on_conflict(
                OnConflict::columns([Column::LicenseId, Column::EntityType, Column::Direction])
                    .update_columns(update_columns)
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to upsert checkpoint", err))?;

        Ok(())
    }

    /// List checkpoints for a license.
    pub async fn list_for_license(&self, license_id: Uuid) -> Result<Vec<Model>, ApiError> {
        Entity::find()
            .filter(Column::LicenseId.eq(license_id))
            .order_by_asc(Column::EntityType)
            .order_by_asc(Column::Direction)
            .all(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to list checkpoints", err))
    }

    /// Clear stored cursors for a license, forcing a full resync.
    ///
    /// Optional filters narrow the reset to one entity type or direction.
    /// Returns the number of checkpoints cleared.
    pub async fn reset(
        &self,
        license_id: Uuid,
        entity_type: Option<EntityType>,
        direction: Option<Direction>,
    ) -> Result<u64, ApiError> {
        let now = Utc::now().fixed_offset();
        let mut query = Entity::update_many()
            .col_expr(Column::Cursor, sea_orm::Value::Json(None).into())
            .col_expr(Column::UpdatedAt, now.into())
            .filter(Column::LicenseId.eq(license_id));

        if let Some(entity_type) = entity_type {
            query = query.filter(Column::EntityType.eq(entity_type.as_str()));
        }
        if let Some(direction) = direction {
            query = query.filter(Column::Direction.eq(direction.as_str()));
        }

        let result = query
            .exec(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to reset checkpoints", err))?;

        tracing::info!(
            license_id = %license_id,
            cleared = result.rows_affected,
            "Checkpoints reset"
        );
        Ok(result.rows_affected)
    }
}
