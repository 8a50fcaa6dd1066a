//! # License Repository
//!
//! Repository operations for the `licenses` table. License numbers are
//! uppercased on write so the natural key is case-insensitive; rows are
//! deactivated rather than deleted to preserve the audit trail.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{ApiError, internal_db_error, is_unique_violation};
use crate::models::license::{ActiveModel, Column, Entity, Model};

/// Fields accepted when registering a new license.
pub struct NewLicense {
    pub license_number: String,
    pub site_id: Uuid,
    /// Already-encrypted credential pair (base64 ciphertext).
    pub api_key_encrypted: String,
    pub user_key_encrypted: String,
    pub auto_sync_enabled: bool,
    pub sync_interval_seconds: i64,
}

/// Mutable fields on an existing license.
#[derive(Default)]
pub struct LicenseUpdate {
    pub active: Option<bool>,
    pub auto_sync_enabled: Option<bool>,
    pub sync_interval_seconds: Option<i64>,
    /// Replacement credential pair, already encrypted.
    pub credentials: Option<(String, String)>,
}

/// Repository for license database operations
pub struct LicenseRepository {
    db: DatabaseConnection,
}

impl LicenseRepository {
    /// Create a new LicenseRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Register a new license. A duplicate license number maps to 409.
    pub async fn create(&self, new: NewLicense) -> Result<Model, ApiError> {
        let now = Utc::now().fixed_offset();

        let license = ActiveModel {
            id: Set(Uuid::new_v4()),
            license_number: Set(new.license_number.to_uppercase()),
            site_id: Set(new.site_id),
            api_key_encrypted: Set(new.api_key_encrypted),
            user_key_encrypted: Set(new.user_key_encrypted),
            active: Set(true),
            auto_sync_enabled: Set(new.auto_sync_enabled),
            sync_interval_seconds: Set(new.sync_interval_seconds),
            last_synced_at: Set(None),
            last_sync_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match license.insert(&self.db).await {
            Ok(model) => {
                tracing::info!(
                    license_id = %model.id,
                    license_number = %model.license_number,
                    "License registered"
                );
                Ok(model)
            }
            Err(err) if is_unique_violation(&err) => Err(crate::error::conflict(
                "A license with this number already exists",
            )),
            Err(err) => Err(internal_db_error("Failed to create license", err)),
        }
    }

    /// Find a license by ID.
    pub async fn find_by_id(&self, license_id: Uuid) -> Result<Option<Model>, ApiError> {
        Entity::find_by_id(license_id)
            .one(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to find license", err))
    }

    /// Find a license by its number (case-insensitive).
    pub async fn find_by_number(&self, license_number: &str) -> Result<Option<Model>, ApiError> {
        Entity::find()
            .filter(Column::LicenseNumber.eq(license_number.to_uppercase()))
            .one(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to find license", err))
    }

    /// List licenses, optionally restricted to active ones.
    pub async fn list(&self, active_only: bool) -> Result<Vec<Model>, ApiError> {
        let mut query = Entity::find().order_by_asc(Column::LicenseNumber);
        if active_only {
            query = query.filter(Column::Active.eq(true));
        }
        query
            .all(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to list licenses", err))
    }

    /// Apply a partial update to a license.
    pub async fn update(&self, license_id: Uuid, update: LicenseUpdate) -> Result<Model, ApiError> {
        let license = self
            .find_by_id(license_id)
            .await?
            .ok_or_else(|| crate::error::not_found("License not found"))?;

        let mut active_model: ActiveModel = license.into();
        if let Some(active) = update.active {
            active_model.active = Set(active);
        }
        if let Some(enabled) = update.auto_sync_enabled {
            active_model.auto_sync_enabled = Set(enabled);
        }
        if let Some(interval) = update.sync_interval_seconds {
            active_model.sync_interval_seconds = Set(interval);
        }
        if let Some((api_key, user_key)) = update.credentials {
            active_model.api_key_encrypted = Set(api_key);
            active_model.user_key_encrypted = Set(user_key);
            // New credentials clear a credential-failure halt.
            active_model.last_sync_error = Set(None);
        }
        active_model.updated_at = Set(Utc::now().fixed_offset());

        active_model
            .update(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to update license", err))
    }

    /// Record a successful sync pass, clearing any halt error.
    pub async fn mark_synced(&self, license_id: Uuid) -> Result<(), ApiError> {
        let now = Utc::now().fixed_offset();
        Entity::update_many()
            .col_expr(Column::LastSyncedAt, now.into())
            .col_expr(Column::LastSyncError, sea_orm::Value::Json(None).into())
            .col_expr(Column::UpdatedAt, now.into())
            .filter(Column::Id.eq(license_id))
            .exec(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to mark license synced", err))?;
        Ok(())
    }

    /// Record a sync-halting error (credential rejection, config failure).
    ///
    /// A non-null `last_sync_error` stops the drive loop from scheduling
    /// further work until the license is updated.
    pub async fn set_sync_error(
        &self,
        license_id: Uuid,
        error: JsonValue,
    ) -> Result<(), ApiError> {
        let now = Utc::now().fixed_offset();
        Entity::update_many()
            .col_expr(Column::LastSyncError, error.into())
            .col_expr(Column::UpdatedAt, now.into())
            .filter(Column::Id.eq(license_id))
            .exec(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to record license sync error", err))?;
        Ok(())
    }

    /// Licenses eligible for automatic sync scheduling: active, auto-sync
    /// enabled, not halted, and past their interval since the last pass.
    pub async fn list_auto_sync_due(&self) -> Result<Vec<Model>, ApiError> {
        let licenses = Entity::find()
            .filter(Column::Active.eq(true))
            .filter(Column::AutoSyncEnabled.eq(true))
            .filter(Column::LastSyncError.is_null())
            .all(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to list auto-sync licenses", err))?;

        let now = Utc::now();
        Ok(licenses
            .into_iter()
            .filter(|license| match license.last_synced_at {
                None => true,
                Some(last) => {
                    (now - last.with_timezone(&Utc)).num_seconds() >= license.sync_interval_seconds
                }
            })
            .collect())
    }
}
