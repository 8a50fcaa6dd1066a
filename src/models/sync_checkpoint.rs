//! SyncCheckpoint entity model
//!
//! Durable cursor per (license, entity type, direction) tuple. Writes are
//! linearized by the per-license drive loop; the storage layer only needs
//! atomic upsert.

use super::license::Entity as License;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// SyncCheckpoint entity marking synchronization progress
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_checkpoints")]
pub struct Model {
    /// Unique identifier for the checkpoint (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// License this checkpoint belongs to
    pub license_id: Uuid,

    /// Entity type this cursor tracks
    pub entity_type: String,

    /// Direction this cursor tracks (push, pull)
    pub direction: String,

    /// Opaque registry cursor (revision, timestamp, or page token)
    #[sea_orm(column_type = "JsonBinary")]
    pub cursor: Option<JsonValue>,

    /// Timestamp of the last run that touched this tuple
    pub last_run_at: Option<DateTimeWithTimeZone>,

    /// Status of the last run (succeeded, failed)
    pub last_status: Option<String>,

    /// Timestamp when the checkpoint was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the checkpoint was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "License",
        from = "Column::LicenseId",
        to = "super::license::Column::Id"
    )]
    License,
}

impl Related<License> for Entity {
    fn to() -> RelationDef {
        Relation::License.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
