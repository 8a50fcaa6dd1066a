//! Audit trail for terminal queue transitions
//!
//! Compliance requires an append-only record of every terminal item outcome
//! and every manual dead-letter action. The engine reports through the
//! [`AuditSink`] trait; the default implementation writes `audit_events`
//! rows in the same database.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use uuid::Uuid;

use crate::models::audit_event;
use crate::models::queue_item::Model as QueueItemModel;

/// Audit outcome strings.
pub mod outcome {
    pub const SUCCEEDED: &str = "succeeded";
    pub const FAILED_PERMANENT: &str = "failed_permanent";
    pub const DISMISSED: &str = "dismissed";
    /// Manual dead-letter retry re-enqueued the item.
    pub const RETRIED: &str = "retried";
}

/// One audit record to be appended.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub license_id: Uuid,
    pub item_id: Uuid,
    pub entity_type: String,
    pub entity_ref: String,
    pub outcome: String,
    /// Operator identity for manual actions; `None` for engine transitions.
    pub actor: Option<String>,
    pub detail: Option<serde_json::Value>,
}

impl AuditRecord {
    /// Build a record for an engine-driven terminal transition on an item.
    pub fn for_item(item: &QueueItemModel, outcome: &str) -> Self {
        Self {
            license_id: item.license_id,
            item_id: item.id,
            entity_type: item.entity_type.clone(),
            entity_ref: item.entity_ref.clone(),
            outcome: outcome.to_string(),
            actor: None,
            detail: item.last_error.clone(),
        }
    }

    /// Attach the acting operator for a manual action.
    pub fn with_actor<S: Into<String>>(mut self, actor: S) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Attach structured detail (error codes, dismissal notes).
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Append-only sink for audit records.
///
/// Sink failures must not fail the sync operation that produced the record;
/// callers log and continue.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), sea_orm::DbErr>;
}

/// Database-backed audit sink writing `audit_events` rows.
pub struct DbAuditSink {
    db: DatabaseConnection,
}

impl DbAuditSink {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditSink for DbAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), sea_orm::DbErr> {
        let event = audit_event::ActiveModel {
            id: Set(Uuid::new_v4()),
            license_id: Set(record.license_id),
            item_id: Set(record.item_id),
            entity_type: Set(record.entity_type),
            entity_ref: Set(record.entity_ref),
            outcome: Set(record.outcome),
            actor: Set(record.actor),
            detail: Set(record.detail),
            created_at: Set(Utc::now().into()),
        };

        event.insert(&self.db).await?;
        Ok(())
    }
}
