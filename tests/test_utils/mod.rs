//! Test utilities for sync engine testing.
//!
//! Provides an in-memory SQLite database with migrations applied, a
//! scriptable registry adapter, an in-memory inventory store, and fixture
//! helpers shared by the integration tests.

// Each test binary uses a different slice of these helpers.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use sea_orm::{Database, DatabaseConnection};
use serde_json::json;
use uuid::Uuid;

use regsync::audit::DbAuditSink;
use regsync::config::AppConfig;
use regsync::crypto::{CryptoKey, encrypt_license_credentials};
use regsync::local::{InventoryError, LocalInventory, LocalRecord, RemoteRecord};
use regsync::migration::{Migrator, MigratorTrait};
use regsync::models::EntityType;
use regsync::models::license::Model as LicenseModel;
use regsync::registry::{
    AdapterError, Cursor, FetchedRecord, RegistryAdapter, RegistryCredentials, SnapshotPage,
    SubmitOutcome, SubmitRequest,
};
use regsync::repositories::LicenseRepository;
use regsync::repositories::license::NewLicense;
use regsync::server::AppState;

pub const TEST_TOKEN: &str = "test-token";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Test configuration with fast orchestrator timings.
#[allow(dead_code)]
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        operator_tokens: vec![TEST_TOKEN.to_string()],
        ..Default::default()
    };
    config.orchestrator.tick_interval_seconds = 1;
    config.orchestrator.item_timeout_seconds = 5;
    config.retry_policy.base_seconds = 1;
    config.retry_policy.jitter_factor = 0.0;
    config
}

pub fn test_crypto_key() -> CryptoKey {
    CryptoKey::new(vec![7u8; 32]).expect("Failed to create test crypto key")
}

/// Registers a license with encrypted test credentials.
pub async fn create_test_license(
    db: &DatabaseConnection,
    key: &CryptoKey,
    license_number: &str,
) -> Result<LicenseModel> {
    let site_id = Uuid::new_v4();
    let encrypted = encrypt_license_credentials(
        key,
        site_id,
        &license_number.to_uppercase(),
        "test-api-key",
        "test-user-key",
    )?;

    let license = LicenseRepository::new(db.clone())
        .create(NewLicense {
            license_number: license_number.to_string(),
            site_id,
            api_key_encrypted: encrypted.api_key,
            user_key_encrypted: encrypted.user_key,
            auto_sync_enabled: false,
            sync_interval_seconds: 900,
        })
        .await
        .map_err(|err| anyhow::anyhow!("{}", err.message))?;
    Ok(license)
}

/// Registry adapter whose behavior is scripted per test.
///
/// Submit calls consume queued responses first and fall back to `Accepted`;
/// fetches serve records registered up front. Every submit is recorded for
/// assertions.
pub struct ScriptedAdapter {
    submit_responses: Mutex<VecDeque<Result<SubmitOutcome, AdapterError>>>,
    entities: Mutex<HashMap<String, FetchedRecord>>,
    snapshots: Mutex<HashMap<String, Vec<FetchedRecord>>>,
    pub submitted: Mutex<Vec<SubmitRequest>>,
}

#[allow(dead_code)]
impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            submit_responses: Mutex::new(VecDeque::new()),
            entities: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Queue a response for the next submit call.
    pub fn push_submit_response(&self, response: Result<SubmitOutcome, AdapterError>) {
        self.submit_responses.lock().unwrap().push_back(response);
    }

    /// Register a record served by `fetch_entity`.
    pub fn set_entity(&self, entity_type: EntityType, record: FetchedRecord) {
        self.entities
            .lock()
            .unwrap()
            .insert(format!("{}:{}", entity_type, record.entity_ref), record);
    }

    /// Register the snapshot served for one entity type.
    pub fn set_snapshot(&self, entity_type: EntityType, records: Vec<FetchedRecord>) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(entity_type.as_str().to_string(), records);
    }

    pub fn submit_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl RegistryAdapter for ScriptedAdapter {
    async fn submit(
        &self,
        _credentials: &RegistryCredentials,
        request: &SubmitRequest,
    ) -> Result<SubmitOutcome, AdapterError> {
        self.submitted.lock().unwrap().push(request.clone());
        match self.submit_responses.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(SubmitOutcome::Accepted { new_cursor: None }),
        }
    }

    async fn fetch_entity(
        &self,
        _credentials: &RegistryCredentials,
        entity_type: EntityType,
        entity_ref: &str,
    ) -> Result<FetchedRecord, AdapterError> {
        self.entities
            .lock()
            .unwrap()
            .get(&format!("{}:{}", entity_type, entity_ref))
            .cloned()
            .ok_or_else(|| AdapterError::permanent(format!("Unknown entity {}", entity_ref)))
    }

    async fn fetch_snapshot(
        &self,
        _credentials: &RegistryCredentials,
        entity_type: EntityType,
        _cursor: Option<&Cursor>,
        _page_size: usize,
    ) -> Result<SnapshotPage, AdapterError> {
        let records = self
            .snapshots
            .lock()
            .unwrap()
            .get(entity_type.as_str())
            .cloned()
            .unwrap_or_default();
        Ok(SnapshotPage {
            records,
            next_cursor: Some(Cursor::from_string("end")),
            has_more: false,
        })
    }
}

/// In-memory local inventory store.
pub struct MemoryInventory {
    records: Mutex<HashMap<String, Vec<LocalRecord>>>,
    pub applied: Mutex<Vec<RemoteRecord>>,
}

#[allow(dead_code)]
impl MemoryInventory {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Seed local records returned by `snapshot` for one entity type.
    pub fn set_records(&self, license_id: Uuid, entity_type: EntityType, records: Vec<LocalRecord>) {
        self.records
            .lock()
            .unwrap()
            .insert(format!("{}:{}", license_id, entity_type), records);
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    /// A dirty local record fixture with a pending first push.
    pub fn dirty_record(entity_ref: &str) -> LocalRecord {
        LocalRecord {
            entity_ref: entity_ref.to_string(),
            revision: 1,
            last_pushed_revision: 0,
            last_seen_remote_revision: None,
            payload: json!({ "ref": entity_ref }),
        }
    }
}

#[async_trait]
impl LocalInventory for MemoryInventory {
    async fn snapshot(
        &self,
        license_id: Uuid,
        entity_type: EntityType,
    ) -> Result<Vec<LocalRecord>, InventoryError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&format!("{}:{}", license_id, entity_type))
            .cloned()
            .unwrap_or_default())
    }

    async fn apply_remote(
        &self,
        _license_id: Uuid,
        _entity_type: EntityType,
        record: &RemoteRecord,
    ) -> Result<(), InventoryError> {
        self.applied.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Application state wired to the scripted adapter and memory inventory.
#[allow(dead_code)]
pub fn test_state(
    db: DatabaseConnection,
    adapter: Arc<ScriptedAdapter>,
    inventory: Arc<MemoryInventory>,
) -> AppState {
    AppState {
        config: Arc::new(test_config()),
        db: db.clone(),
        adapter,
        inventory,
        audit: Arc::new(DbAuditSink::new(db)),
        crypto_key: Arc::new(test_crypto_key()),
    }
}
