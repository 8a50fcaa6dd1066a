//! License entity model
//!
//! One row per regulatory registry account. Credentials are stored
//! AES-GCM-encrypted (base64) and never leave the crypto module as plaintext.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// License entity representing one external registry account
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "licenses")]
pub struct Model {
    /// Unique identifier for the license (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Regulatory license number, uppercased on write (natural key)
    pub license_number: String,

    /// Site this license belongs to
    pub site_id: Uuid,

    /// Encrypted registry API key (base64 of AES-GCM ciphertext)
    pub api_key_encrypted: String,

    /// Encrypted registry user key (base64 of AES-GCM ciphertext)
    pub user_key_encrypted: String,

    /// Whether the license is active; licenses are deactivated, never deleted
    pub active: bool,

    /// Whether the background drive loop schedules work for this license
    pub auto_sync_enabled: bool,

    /// Interval between automatic sync runs
    pub sync_interval_seconds: i64,

    /// Timestamp of the last successful sync pass
    pub last_synced_at: Option<DateTimeWithTimeZone>,

    /// Structured error from the last failed run; non-null halts the drive loop
    #[sea_orm(column_type = "JsonBinary")]
    pub last_sync_error: Option<JsonValue>,

    /// Timestamp when the license was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the license was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
