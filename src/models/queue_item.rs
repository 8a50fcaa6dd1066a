//! QueueItem entity model
//!
//! The unit of sync work: one entity instance, one operation, one attempt
//! history. Live items are deduplicated by idempotency key; terminal rows
//! remain behind for the audit trail.

use super::license::Entity as License;
use super::sync_job::Entity as SyncJob;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// QueueItem entity representing one unit of sync work
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "queue_items")]
pub struct Model {
    /// Unique identifier for the queue item (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Sync job this item belongs to; null for items enqueued by domain
    /// events or reconciliation outside a run
    pub job_id: Option<Uuid>,

    /// License this item syncs against
    pub license_id: Uuid,

    /// Entity type discriminator (plant, harvest, package, transfer, lab_result)
    pub entity_type: String,

    /// Stable reference to the entity instance (local id or registry tag)
    pub entity_ref: String,

    /// Operation to perform (create, update)
    pub operation: String,

    /// Direction of the operation (push, pull)
    pub direction: String,

    /// Opaque serialized operation body; each entity-type handler owns its shape
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Option<JsonValue>,

    /// Deterministic key preventing duplicate live work for the same change
    pub idempotency_key: String,

    /// Current status (pending, processing, succeeded, failed,
    /// failed_permanent, dismissed)
    pub status: String,

    /// Scheduling priority; lower values run sooner
    pub priority: i16,

    /// Not-before time for processing
    pub scheduled_at: DateTimeWithTimeZone,

    /// Hard predecessor that must reach succeeded before this item runs
    pub depends_on_item_id: Option<Uuid>,

    /// Number of failed attempts so far
    pub attempts: i32,

    /// Registry error code from the most recent failure
    pub last_error_code: Option<String>,

    /// Structured detail from the most recent failure
    #[sea_orm(column_type = "JsonBinary")]
    pub last_error: Option<JsonValue>,

    /// Operator notes recorded when the item was dismissed
    pub dismiss_notes: Option<String>,

    /// Timestamp of the transition to failed_permanent
    pub failed_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the queue item was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the queue item was last updated
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
    #[sea_orm(
        belongs_to = "SyncJob",
        from = "Column::JobId",
        to = "super::sync_job::Column::Id"
    )]
    SyncJob,
}

impl Related<License> for Entity {
    fn to() -> RelationDef {
        Relation::License.def()
    }
}

impl Related<SyncJob> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
