//! SyncJob entity model
//!
//! One logical synchronization run for a license. At most one job per
//! license may be in `pending` or `processing` (partial unique index).

use super::license::Entity as License;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// SyncJob entity representing one synchronization run
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    /// Unique identifier for the sync job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// License this job runs against
    pub license_id: Uuid,

    /// Direction of the run (push, pull, both)
    pub direction: String,

    /// Requested entity types as a JSON array of strings
    #[sea_orm(column_type = "JsonBinary")]
    pub entity_types: JsonValue,

    /// Current status (pending, processing, completed, failed, cancelled)
    pub status: String,

    /// Number of queue items enqueued for this job
    pub items_enqueued: i32,

    /// Number of queue items that succeeded
    pub items_succeeded: i32,

    /// Number of queue items that failed permanently
    pub items_failed: i32,

    /// Timestamp when the orchestrator first claimed work for this job
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the job reached a terminal status
    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Structured job-level error (credential/config failures, cancel reason)
    #[sea_orm(column_type = "JsonBinary")]
    pub error: Option<JsonValue>,

    /// Timestamp when the sync job was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the sync job was last updated
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
