//! # Reconciliation Engine
//!
//! Periodic safety net that compares local inventory against the registry
//! and enqueues corrective work through the sync queue. Reconciliation
//! never mutates either side directly; the queue remains the single
//! mutation path. Divergence where both sides changed is a conflict and is
//! surfaced for an operator, never auto-resolved.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use sea_orm::DatabaseConnection;
use serde::Serialize;
use tracing::{info, instrument};
use utoipa::ToSchema;

use crate::config::AppConfig;
use crate::crypto::{CryptoKey, decrypt_license_credentials};
use crate::error::ApiError;
use crate::local::{LocalInventory, LocalRecord};
use crate::models::license::Model as LicenseModel;
use crate::models::{Direction, EntityType, Operation};
use crate::registry::{FetchedRecord, RegistryAdapter, RegistryCredentials};
use crate::repositories::QueueRepository;
use crate::repositories::queue::EnqueueRequest;

/// An entity that changed on both sides since the last sync.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Conflict {
    pub entity_type: String,
    pub entity_ref: String,
    /// Local revision at the time of comparison.
    pub local_revision: i64,
    /// Registry revision at the time of comparison.
    pub remote_revision: String,
}

/// Per-entity-type outcome counts for one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct EntityTypeCounts {
    pub in_sync: u64,
    pub enqueued_push: u64,
    pub enqueued_pull: u64,
    pub conflicts: u64,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct ReconcileSummary {
    /// Entities already consistent on both sides.
    pub in_sync: u64,
    /// Push items enqueued for locally changed entities.
    pub enqueued_push: u64,
    /// Pull items enqueued for remotely changed entities.
    pub enqueued_pull: u64,
    /// Entities changed on both sides; left untouched.
    pub conflicts: Vec<Conflict>,
    /// The same counts broken down by entity type.
    pub by_entity_type: BTreeMap<String, EntityTypeCounts>,
}

/// Compares local and registry state for a license and enqueues fixes.
pub struct Reconciler {
    config: Arc<AppConfig>,
    db: Arc<DatabaseConnection>,
    adapter: Arc<dyn RegistryAdapter>,
    inventory: Arc<dyn LocalInventory>,
    crypto_key: Arc<CryptoKey>,
}

impl Reconciler {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        adapter: Arc<dyn RegistryAdapter>,
        inventory: Arc<dyn LocalInventory>,
        crypto_key: Arc<CryptoKey>,
    ) -> Self {
        Self {
            config,
            db,
            adapter,
            inventory,
            crypto_key,
        }
    }

    /// Reconcile the given entity types for one license.
    #[instrument(skip_all, fields(license_id = %license.id))]
    pub async fn reconcile(
        &self,
        license: &LicenseModel,
        entity_types: &[EntityType],
    ) -> Result<ReconcileSummary, ApiError> {
        let pair = decrypt_license_credentials(&self.crypto_key, license)
            .map_err(|err| ApiError::from(anyhow::anyhow!(err)))?;
        let credentials = RegistryCredentials {
            license_number: license.license_number.clone(),
            api_key: pair.api_key,
            user_key: pair.user_key,
        };

        let mut summary = ReconcileSummary::default();
        for entity_type in entity_types {
            let counts = self
                .reconcile_entity_type(license, *entity_type, &credentials, &mut summary.conflicts)
                .await?;
            summary.in_sync += counts.in_sync;
            summary.enqueued_push += counts.enqueued_push;
            summary.enqueued_pull += counts.enqueued_pull;
            summary
                .by_entity_type
                .insert(entity_type.as_str().to_string(), counts);
        }

        info!(
            in_sync = summary.in_sync,
            enqueued_push = summary.enqueued_push,
            enqueued_pull = summary.enqueued_pull,
            conflicts = summary.conflicts.len(),
            "Reconciliation pass finished"
        );
        Ok(summary)
    }

    async fn reconcile_entity_type(
        &self,
        license: &LicenseModel,
        entity_type: EntityType,
        credentials: &RegistryCredentials,
        conflicts: &mut Vec<Conflict>,
    ) -> Result<EntityTypeCounts, ApiError> {
        let local_records = self
            .inventory
            .snapshot(license.id, entity_type)
            .await
            .map_err(|err| ApiError::from(anyhow::anyhow!(err)))?;
        let remote_records = self.fetch_full_snapshot(entity_type, credentials).await?;

        let locals: HashMap<&str, &LocalRecord> = local_records
            .iter()
            .map(|record| (record.entity_ref.as_str(), record))
            .collect();
        let remotes: HashMap<&str, &FetchedRecord> = remote_records
            .iter()
            .map(|record| (record.entity_ref.as_str(), record))
            .collect();

        let queue = QueueRepository::new(self.db.as_ref().clone());
        let mut counts = EntityTypeCounts::default();

        for (entity_ref, local) in &locals {
            match remotes.get(entity_ref) {
                None => {
                    // Local-only entity: the registry never saw it.
                    self.enqueue_push(&queue, license, entity_type, local, Operation::Create)
                        .await?;
                    counts.enqueued_push += 1;
                }
                Some(remote) => {
                    let local_dirty = local.is_dirty();
                    let remote_dirty = local.last_seen_remote_revision.as_deref()
                        != Some(remote.revision.as_str());

                    match (local_dirty, remote_dirty) {
                        (false, false) => counts.in_sync += 1,
                        (true, false) => {
                            self.enqueue_push(
                                &queue,
                                license,
                                entity_type,
                                local,
                                Operation::Update,
                            )
                            .await?;
                            counts.enqueued_push += 1;
                        }
                        (false, true) => {
                            self.enqueue_pull(&queue, license, entity_type, remote)
                                .await?;
                            counts.enqueued_pull += 1;
                        }
                        (true, true) => {
                            counts.conflicts += 1;
                            conflicts.push(Conflict {
                                entity_type: entity_type.as_str().to_string(),
                                entity_ref: (*entity_ref).to_string(),
                                local_revision: local.revision,
                                remote_revision: remote.revision.clone(),
                            });
                        }
                    }
                }
            }
        }

        // Registry-only entities are pulled into the local store.
        for (entity_ref, remote) in &remotes {
            if !locals.contains_key(entity_ref) {
                self.enqueue_pull(&queue, license, entity_type, remote)
                    .await?;
                counts.enqueued_pull += 1;
            }
        }

        Ok(counts)
    }

    /// Read the complete registry listing for one entity type. Cursors are
    /// paged locally and deliberately not persisted: reconciliation always
    /// looks at the whole remote state.
    async fn fetch_full_snapshot(
        &self,
        entity_type: EntityType,
        credentials: &RegistryCredentials,
    ) -> Result<Vec<FetchedRecord>, ApiError> {
        let mut records = Vec::new();
        let mut cursor = None;

        loop {
            let page = self
                .adapter
                .fetch_snapshot(
                    credentials,
                    entity_type,
                    cursor.as_ref(),
                    self.config.orchestrator.snapshot_page_size,
                )
                .await
                .map_err(|err| ApiError::from(anyhow::anyhow!(err)))?;

            records.extend(page.records);
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }

        Ok(records)
    }

    async fn enqueue_push(
        &self,
        queue: &QueueRepository,
        license: &LicenseModel,
        entity_type: EntityType,
        local: &LocalRecord,
        operation: Operation,
    ) -> Result<(), ApiError> {
        queue
            .enqueue(EnqueueRequest {
                license_id: license.id,
                job_id: None,
                entity_type,
                entity_ref: local.entity_ref.clone(),
                operation,
                direction: Direction::Push,
                payload: Some(local.payload.clone()),
                priority: 50,
                depends_on_item_id: None,
            })
            .await?;
        Ok(())
    }

    async fn enqueue_pull(
        &self,
        queue: &QueueRepository,
        license: &LicenseModel,
        entity_type: EntityType,
        remote: &FetchedRecord,
    ) -> Result<(), ApiError> {
        queue
            .enqueue(EnqueueRequest {
                license_id: license.id,
                job_id: None,
                entity_type,
                entity_ref: remote.entity_ref.clone(),
                operation: Operation::Update,
                direction: Direction::Pull,
                payload: Some(remote.payload.clone()),
                priority: 50,
                depends_on_item_id: None,
            })
            .await?;
        Ok(())
    }
}
