//! Local inventory interface
//!
//! The sync engine reads and writes the site's own inventory store through
//! this trait. Implementations live with the inventory service; the engine
//! only needs revision metadata for change detection and a way to apply
//! registry state locally.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::EntityType;

pub mod http;

/// A local inventory record as seen by the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    pub entity_ref: String,
    /// Monotonic local revision, bumped on every local edit.
    pub revision: i64,
    /// Revision last confirmed pushed to the registry; `revision` ahead of
    /// this means the record is locally dirty.
    pub last_pushed_revision: i64,
    /// Registry revision last observed for this record (via push confirm or
    /// pull apply). A differing registry revision means the remote side
    /// changed.
    pub last_seen_remote_revision: Option<String>,
    pub payload: serde_json::Value,
}

impl LocalRecord {
    /// Whether local edits exist that the registry has not seen.
    pub fn is_dirty(&self) -> bool {
        self.revision != self.last_pushed_revision
    }
}

/// A registry record being applied to the local store.
#[derive(Debug, Clone)]
pub struct RemoteRecord {
    pub entity_ref: String,
    /// Registry-side revision identifier, recorded for future comparisons.
    pub revision: String,
    pub payload: serde_json::Value,
}

/// Errors from the local inventory store.
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("local record not found: {entity_ref}")]
    NotFound { entity_ref: String },
    #[error("local store error: {0}")]
    Store(String),
}

/// Interface to the site's local inventory store.
#[async_trait]
pub trait LocalInventory: Send + Sync {
    /// Snapshot all local records of one entity type for a license.
    async fn snapshot(
        &self,
        license_id: Uuid,
        entity_type: EntityType,
    ) -> Result<Vec<LocalRecord>, InventoryError>;

    /// Apply a registry record to the local store (pull direction).
    ///
    /// Implementations must record the registry revision and leave the local
    /// record clean (`revision == last_pushed_revision`) afterwards.
    async fn apply_remote(
        &self,
        license_id: Uuid,
        entity_type: EntityType,
        record: &RemoteRecord,
    ) -> Result<(), InventoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_detection() {
        let mut record = LocalRecord {
            entity_ref: "PKG-1".to_string(),
            revision: 4,
            last_pushed_revision: 4,
            last_seen_remote_revision: None,
            payload: serde_json::json!({}),
        };
        assert!(!record.is_dirty());

        record.revision = 5;
        assert!(record.is_dirty());
    }
}
