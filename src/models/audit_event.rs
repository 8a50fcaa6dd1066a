//! AuditEvent entity model
//!
//! Append-only compliance audit trail. Rows are inserted on terminal queue
//! item transitions and manual dead-letter actions, and never mutated.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// AuditEvent entity recording one terminal transition
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "audit_events")]
pub struct Model {
    /// Unique identifier for the audit event (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// License the item belonged to
    pub license_id: Uuid,

    /// Queue item the event refers to
    pub item_id: Uuid,

    /// Entity type of the item
    pub entity_type: String,

    /// Entity reference of the item
    pub entity_ref: String,

    /// Outcome (succeeded, failed_permanent, dismissed, retried)
    pub outcome: String,

    /// Operator identity for manual actions; null for engine transitions
    pub actor: Option<String>,

    /// Structured detail (error codes, dismissal notes)
    #[sea_orm(column_type = "JsonBinary")]
    pub detail: Option<JsonValue>,

    /// Timestamp when the event was recorded
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
