//! # Sync Orchestrator
//!
//! Background service that turns queued work into registry calls. A
//! supervisor tick discovers licenses with runnable work and spawns one
//! drive loop per license; each drive loop claims batches under a
//! per-minute rate budget and processes items on a bounded worker pool.
//! All cross-restart state lives in the database, so a crashed instance
//! resumes by reading the queue.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use metrics::{counter, histogram};
use sea_orm::DatabaseConnection;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditSink, outcome};
use crate::config::AppConfig;
use crate::crypto::{CryptoKey, decrypt_license_credentials};
use crate::error::ApiError;
use crate::local::LocalInventory;
use crate::models::license::Model as LicenseModel;
use crate::models::queue_item::Model as QueueItemModel;
use crate::models::sync_job::Model as SyncJobModel;
use crate::models::{Direction, EntityType, JobDirection, Operation, job_status};
use crate::registry::{
    AdapterError, AdapterErrorKind, Cursor, RegistryAdapter, RegistryCredentials, SubmitOutcome,
    SubmitRequest,
};
use crate::repositories::queue::{EnqueueRequest, FailureDisposition};
use crate::repositories::{
    CheckpointRepository, LicenseRepository, QueueRepository, SyncJobRepository,
};

/// Per-license registry call budget over a rolling minute window.
///
/// The budget is tracked in memory because it only shapes politeness toward
/// the registry; correctness does not depend on it surviving restarts.
struct RateBudget {
    limit: u32,
    window_start: Instant,
    used: u32,
}

impl RateBudget {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            window_start: Instant::now(),
            used: 0,
        }
    }

    /// Take up to `want` call slots from the current window.
    fn take(&mut self, want: usize) -> usize {
        if self.window_start.elapsed() >= TokioDuration::from_secs(60) {
            self.window_start = Instant::now();
            self.used = 0;
        }
        let remaining = self.limit.saturating_sub(self.used) as usize;
        let granted = want.min(remaining);
        self.used += granted as u32;
        granted
    }

    /// Time until the current window rolls over.
    fn until_refill(&self) -> TokioDuration {
        TokioDuration::from_secs(60).saturating_sub(self.window_start.elapsed())
    }
}

/// Result of processing one claimed item.
enum ItemResult {
    Succeeded,
    Rescheduled,
    DeadLettered,
    /// Credential rejection; the license is halted and the drive loop stops.
    Halted,
}

/// Background sync orchestrator service.
pub struct Orchestrator {
    config: Arc<AppConfig>,
    db: Arc<DatabaseConnection>,
    adapter: Arc<dyn RegistryAdapter>,
    inventory: Arc<dyn LocalInventory>,
    audit: Arc<dyn AuditSink>,
    crypto_key: Arc<CryptoKey>,
    /// Licenses with a live drive loop; guards against double-driving.
    driving: Mutex<HashSet<Uuid>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        adapter: Arc<dyn RegistryAdapter>,
        inventory: Arc<dyn LocalInventory>,
        audit: Arc<dyn AuditSink>,
        crypto_key: Arc<CryptoKey>,
    ) -> Self {
        Self {
            config,
            db,
            adapter,
            inventory,
            audit,
            crypto_key,
            driving: Mutex::new(HashSet::new()),
        }
    }

    fn licenses(&self) -> LicenseRepository {
        LicenseRepository::new(self.db.as_ref().clone())
    }

    fn jobs(&self) -> SyncJobRepository {
        SyncJobRepository::new(self.db.as_ref().clone())
    }

    fn queue(&self) -> QueueRepository {
        QueueRepository::new(self.db.as_ref().clone())
    }

    fn checkpoints(&self) -> CheckpointRepository {
        CheckpointRepository::new(self.db.as_ref().clone())
    }

    /// Run the supervisor loop until the shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), ApiError> {
        info!("Starting sync orchestrator");
        let tick_interval =
            TokioDuration::from_secs(self.config.orchestrator.tick_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync orchestrator shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick(&shutdown).await {
                        error!(error = ?err, "Orchestrator tick failed");
                    }
                    histogram!("regsync_orchestrator_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Sync orchestrator stopped");
        Ok(())
    }

    async fn tick(self: &Arc<Self>, shutdown: &CancellationToken) -> Result<(), ApiError> {
        // Items stuck in processing can only come from a crashed instance.
        self.queue()
            .recover_stale_processing(self.config.orchestrator.item_timeout_seconds * 2)
            .await?;

        self.schedule_auto_sync().await?;

        for license in self.licenses().list(true).await? {
            if license.last_sync_error.is_some() {
                continue;
            }
            let runnable = self.jobs().find_active_for_license(license.id).await?.is_some()
                || self.queue().has_live_items(license.id).await?;
            if runnable {
                self.spawn_drive_loop(license, shutdown.child_token());
            }
        }

        Ok(())
    }

    /// Start jobs for licenses whose auto-sync interval has elapsed.
    async fn schedule_auto_sync(&self) -> Result<(), ApiError> {
        for license in self.licenses().list_auto_sync_due().await? {
            match self
                .jobs()
                .start_job(license.id, JobDirection::Both, &EntityType::ALL)
                .await
            {
                Ok(job) => {
                    counter!("regsync_jobs_auto_started_total").increment(1);
                    debug!(license_id = %license.id, job_id = %job.id, "Auto-sync job started");
                }
                // A job is already running; the interval elapses again later.
                Err(err) if err.code.as_ref() == "SYNC_ALREADY_RUNNING" => {}
                Err(err) => {
                    warn!(license_id = %license.id, error = ?err, "Failed to auto-start sync job");
                }
            }
        }
        Ok(())
    }

    fn spawn_drive_loop(self: &Arc<Self>, license: LicenseModel, cancel: CancellationToken) {
        {
            let mut driving = match self.driving.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !driving.insert(license.id) {
                return;
            }
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let license_id = license.id;
            if let Err(err) = this.drive_license(license, cancel).await {
                error!(license_id = %license_id, error = ?err, "Drive loop failed");
            }
            let mut driving = match this.driving.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            driving.remove(&license_id);
        });
    }

    /// Drive one license until its queue drains, it is rate-starved into the
    /// next window, or shutdown/halt intervenes.
    #[instrument(skip_all, fields(license_id = %license.id))]
    async fn drive_license(
        self: &Arc<Self>,
        license: LicenseModel,
        cancel: CancellationToken,
    ) -> Result<(), ApiError> {
        let credentials = match self.decrypt_credentials(&license) {
            Ok(credentials) => credentials,
            Err(err) => {
                self.halt_license(&license, &AdapterError::unauthorized(err.to_string()))
                    .await?;
                return Ok(());
            }
        };
        let credentials = Arc::new(credentials);

        // A freshly started job needs its work seeded before claiming.
        if let Some(job) = self.jobs().find_active_for_license(license.id).await? {
            if job.status == job_status::PENDING {
                if self.jobs().mark_processing(job.id).await? {
                    if let Err(adapter_err) = self.seed_job(&license, &job, &credentials).await {
                        return self.fail_job_from_seed(&license, &job, adapter_err).await;
                    }
                }
            }
        }

        let mut budget = RateBudget::new(self.config.orchestrator.rate_limit_per_minute);
        let semaphore = Arc::new(Semaphore::new(self.config.orchestrator.worker_concurrency));

        loop {
            if cancel.is_cancelled() {
                debug!("Drive loop cancelled");
                return Ok(());
            }

            self.queue().promote_due_retries(license.id).await?;

            let granted = budget.take(self.config.orchestrator.batch_size);
            if granted == 0 {
                let wait = budget.until_refill();
                debug!(wait_ms = wait.as_millis() as u64, "Rate budget exhausted");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = sleep(wait) => continue,
                }
            }

            let batch = self.queue().ready_batch(license.id, granted).await?;
            if batch.is_empty() {
                if self.queue().has_live_items(license.id).await? {
                    // Rescheduled items exist but none are due yet.
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = sleep(TokioDuration::from_secs(1)) => continue,
                    }
                }
                return self.finish_drained(&license).await;
            }

            counter!("regsync_items_claimed_total").increment(batch.len() as u64);

            let mut workers = JoinSet::new();
            for item in batch {
                let this = Arc::clone(self);
                let credentials = Arc::clone(&credentials);
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| {
                        ApiError::from(anyhow::anyhow!("worker semaphore closed"))
                    })?;
                workers.spawn(async move {
                    let _permit = permit;
                    this.process_item(item, &credentials).await
                });
            }

            let mut halted = false;
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(Ok(ItemResult::Halted)) => halted = true,
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => error!(error = ?err, "Item processing failed"),
                    Err(err) => error!(error = ?err, "Item worker panicked"),
                }
            }
            if halted {
                warn!("License halted mid-batch; stopping drive loop");
                return Ok(());
            }
        }
    }

    /// The queue is drained: finalize the active job and stamp the license.
    async fn finish_drained(&self, license: &LicenseModel) -> Result<(), ApiError> {
        if let Some(job) = self.jobs().find_active_for_license(license.id).await? {
            if job.status == job_status::PROCESSING
                && self.queue().live_count_for_job(job.id).await? == 0
            {
                let finished = self
                    .jobs()
                    .finish(job.id, job_status::COMPLETED, None)
                    .await?;
                info!(
                    job_id = %finished.id,
                    succeeded = finished.items_succeeded,
                    failed = finished.items_failed,
                    "Sync job completed"
                );
                counter!("regsync_jobs_completed_total").increment(1);
            }
        }
        self.licenses().mark_synced(license.id).await?;
        Ok(())
    }

    fn decrypt_credentials(
        &self,
        license: &LicenseModel,
    ) -> Result<RegistryCredentials, crate::crypto::CryptoError> {
        let pair = decrypt_license_credentials(&self.crypto_key, license)?;
        Ok(RegistryCredentials {
            license_number: license.license_number.clone(),
            api_key: pair.api_key,
            user_key: pair.user_key,
        })
    }

    /// Halt the license after a credential failure. Queued items stay put
    /// and resume once the credentials are replaced.
    async fn halt_license(
        &self,
        license: &LicenseModel,
        error: &AdapterError,
    ) -> Result<(), ApiError> {
        warn!(license_id = %license.id, error = %error, "Halting license on credential failure");
        counter!("regsync_licenses_halted_total").increment(1);
        self.licenses()
            .set_sync_error(
                license.id,
                serde_json::to_value(error).unwrap_or(json!({ "type": "unauthorized" })),
            )
            .await?;

        if let Some(job) = self.jobs().find_active_for_license(license.id).await? {
            self.jobs()
                .finish(
                    job.id,
                    job_status::FAILED,
                    Some(serde_json::to_value(error).unwrap_or(json!(null))),
                )
                .await?;
        }
        Ok(())
    }

    async fn fail_job_from_seed(
        &self,
        license: &LicenseModel,
        job: &SyncJobModel,
        error: AdapterError,
    ) -> Result<(), ApiError> {
        if matches!(error.kind, AdapterErrorKind::Unauthorized) {
            return self.halt_license(license, &error).await;
        }
        warn!(job_id = %job.id, error = %error, "Job seeding failed");
        self.jobs()
            .finish(
                job.id,
                job_status::FAILED,
                Some(serde_json::to_value(&error).unwrap_or(json!(null))),
            )
            .await?;
        Ok(())
    }

    /// Enqueue the job's work: dirty local records for push, registry
    /// snapshot pages for pull. Entity types are seeded in causal order so
    /// priorities keep referenced entities ahead of their dependents.
    async fn seed_job(
        &self,
        license: &LicenseModel,
        job: &SyncJobModel,
        credentials: &RegistryCredentials,
    ) -> Result<(), AdapterError> {
        let direction = JobDirection::parse(&job.direction)
            .ok_or_else(|| AdapterError::permanent("Job has an unknown direction"))?;
        let entity_types: Vec<EntityType> = EntityType::ALL
            .into_iter()
            .filter(|entity_type| {
                job.entity_types
                    .as_array()
                    .map(|requested| requested.iter().any(|v| v == entity_type.as_str()))
                    .unwrap_or(false)
            })
            .collect();

        let mut enqueued = 0i32;

        for (order, entity_type) in entity_types.iter().enumerate() {
            let priority = (10 + order * 10) as i16;

            if direction.includes(Direction::Push) {
                enqueued += self
                    .seed_push(license, job, *entity_type, priority)
                    .await
                    .map_err(|err| AdapterError::transient(err.message.to_string()))?;
            }
            if direction.includes(Direction::Pull) {
                enqueued += self
                    .seed_pull(license, job, *entity_type, priority, credentials)
                    .await?;
            }
        }

        self.jobs()
            .add_enqueued(job.id, enqueued)
            .await
            .map_err(|err| AdapterError::transient(err.message.to_string()))?;
        info!(job_id = %job.id, enqueued, "Sync job seeded");
        Ok(())
    }

    async fn seed_push(
        &self,
        license: &LicenseModel,
        job: &SyncJobModel,
        entity_type: EntityType,
        priority: i16,
    ) -> Result<i32, ApiError> {
        let records = self
            .inventory
            .snapshot(license.id, entity_type)
            .await
            .map_err(|err| ApiError::from(anyhow::anyhow!(err)))?;

        let mut enqueued = 0;
        for record in records.into_iter().filter(|record| record.is_dirty()) {
            let operation = if record.last_pushed_revision == 0 {
                Operation::Create
            } else {
                Operation::Update
            };
            let outcome = self
                .queue()
                .enqueue(EnqueueRequest {
                    license_id: license.id,
                    job_id: Some(job.id),
                    entity_type,
                    entity_ref: record.entity_ref,
                    operation,
                    direction: Direction::Push,
                    payload: Some(record.payload),
                    priority,
                    depends_on_item_id: None,
                })
                .await?;
            if outcome.is_created() {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    async fn seed_pull(
        &self,
        license: &LicenseModel,
        job: &SyncJobModel,
        entity_type: EntityType,
        priority: i16,
        credentials: &RegistryCredentials,
    ) -> Result<i32, AdapterError> {
        let checkpoints = self.checkpoints();
        let mut cursor = checkpoints
            .cursor(license.id, entity_type, Direction::Pull)
            .await
            .map_err(|err| AdapterError::transient(err.message.to_string()))?;

        let mut enqueued = 0;
        loop {
            let page = self
                .adapter
                .fetch_snapshot(
                    credentials,
                    entity_type,
                    cursor.as_ref(),
                    self.config.orchestrator.snapshot_page_size,
                )
                .await?;

            for record in &page.records {
                let outcome = self
                    .queue()
                    .enqueue(EnqueueRequest {
                        license_id: license.id,
                        job_id: Some(job.id),
                        entity_type,
                        entity_ref: record.entity_ref.clone(),
                        operation: Operation::Update,
                        direction: Direction::Pull,
                        payload: Some(record.payload.clone()),
                        priority,
                        depends_on_item_id: None,
                    })
                    .await
                    .map_err(|err| AdapterError::transient(err.message.to_string()))?;
                if outcome.is_created() {
                    enqueued += 1;
                }
            }

            // Advance the pull cursor page by page; a crash mid-seed resumes
            // from the last committed page instead of re-reading everything.
            checkpoints
                .upsert(
                    license.id,
                    entity_type,
                    Direction::Pull,
                    page.next_cursor.as_ref(),
                    "succeeded",
                )
                .await
                .map_err(|err| AdapterError::transient(err.message.to_string()))?;

            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }
        Ok(enqueued)
    }

    /// Process one claimed item end to end.
    async fn process_item(
        &self,
        item: QueueItemModel,
        credentials: &RegistryCredentials,
    ) -> Result<ItemResult, ApiError> {
        let started = Instant::now();
        let result = self.execute_item(&item, credentials).await;
        histogram!("regsync_item_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        match result {
            Ok(already_applied) => {
                let updated = self.queue().mark_succeeded(item).await?;
                if let Some(job_id) = updated.job_id {
                    self.jobs().record_item_outcome(job_id, true).await?;
                }
                let mut record = AuditRecord::for_item(&updated, outcome::SUCCEEDED);
                if already_applied {
                    record = record.with_detail(json!({ "already_applied": true }));
                }
                if let Err(err) = self.audit.record(record).await {
                    warn!(error = ?err, "Failed to write audit record");
                }
                counter!("regsync_items_succeeded_total").increment(1);
                Ok(ItemResult::Succeeded)
            }
            Err(error) => self.handle_item_failure(item, error).await,
        }
    }

    /// Run the registry call for one item. Returns whether the registry
    /// reported the submission as already applied.
    async fn execute_item(
        &self,
        item: &QueueItemModel,
        credentials: &RegistryCredentials,
    ) -> Result<bool, AdapterError> {
        let entity_type = EntityType::parse(&item.entity_type)
            .ok_or_else(|| AdapterError::permanent("Item has an unknown entity type"))?;
        let direction = Direction::parse(&item.direction)
            .ok_or_else(|| AdapterError::permanent("Item has an unknown direction"))?;
        let timeout = TokioDuration::from_secs(self.config.orchestrator.item_timeout_seconds);

        match direction {
            Direction::Push => {
                let operation = Operation::parse(&item.operation)
                    .ok_or_else(|| AdapterError::permanent("Item has an unknown operation"))?;
                let request = SubmitRequest {
                    entity_type,
                    entity_ref: item.entity_ref.clone(),
                    operation,
                    idempotency_key: item.idempotency_key.clone(),
                    payload: item.payload.clone().unwrap_or(json!({})),
                };

                let submit = self.adapter.submit(credentials, &request);
                let outcome = tokio::time::timeout(timeout, submit)
                    .await
                    .map_err(|_| AdapterError::timeout("Registry submit timed out"))??;

                match outcome {
                    SubmitOutcome::Accepted { new_cursor } => {
                        self.advance_push_cursor(item, entity_type, new_cursor.as_ref())
                            .await;
                        Ok(false)
                    }
                    SubmitOutcome::AlreadyApplied => Ok(true),
                    SubmitOutcome::Rejected {
                        code,
                        message,
                        retryable,
                    } => {
                        let error = if retryable {
                            AdapterError::transient(message)
                        } else {
                            AdapterError::permanent(message)
                        };
                        Err(error.with_details(json!({ "registry_code": code })))
                    }
                }
            }
            Direction::Pull => {
                let fetch = self
                    .adapter
                    .fetch_entity(credentials, entity_type, &item.entity_ref);
                let record = tokio::time::timeout(timeout, fetch)
                    .await
                    .map_err(|_| AdapterError::timeout("Registry fetch timed out"))??;

                let remote = crate::local::RemoteRecord {
                    entity_ref: record.entity_ref,
                    revision: record.revision,
                    payload: record.payload,
                };
                self.inventory
                    .apply_remote(item.license_id, entity_type, &remote)
                    .await
                    .map_err(|err| AdapterError::transient(err.to_string()))?;
                Ok(false)
            }
        }
    }

    async fn advance_push_cursor(
        &self,
        item: &QueueItemModel,
        entity_type: EntityType,
        cursor: Option<&Cursor>,
    ) {
        if let Err(err) = self
            .checkpoints()
            .upsert(
                item.license_id,
                entity_type,
                Direction::Push,
                cursor,
                "succeeded",
            )
            .await
        {
            // The cursor only optimizes future runs; losing one advance is
            // recoverable.
            warn!(error = ?err, "Failed to advance push checkpoint");
        }
    }

    async fn handle_item_failure(
        &self,
        item: QueueItemModel,
        error: AdapterError,
    ) -> Result<ItemResult, ApiError> {
        if matches!(error.kind, AdapterErrorKind::Unauthorized) {
            // Not the item's fault: release it and halt the whole license.
            let license = self
                .licenses()
                .find_by_id(item.license_id)
                .await?
                .ok_or_else(|| crate::error::not_found("License not found"))?;
            self.queue().release_to_pending(item).await?;
            self.halt_license(&license, &error).await?;
            return Ok(ItemResult::Halted);
        }

        let (updated, disposition) = self
            .queue()
            .mark_failed(item, &error, &self.config.retry_policy)
            .await?;

        match disposition {
            FailureDisposition::Rescheduled { next_at } => {
                debug!(
                    item_id = %updated.id,
                    attempts = updated.attempts,
                    next_at = %next_at,
                    "Item rescheduled"
                );
                counter!("regsync_items_rescheduled_total").increment(1);
                Ok(ItemResult::Rescheduled)
            }
            FailureDisposition::DeadLettered => {
                if let Some(job_id) = updated.job_id {
                    self.jobs().record_item_outcome(job_id, false).await?;
                }
                let record = AuditRecord::for_item(&updated, outcome::FAILED_PERMANENT);
                if let Err(err) = self.audit.record(record).await {
                    warn!(error = ?err, "Failed to write audit record");
                }
                counter!("regsync_items_dead_lettered_total").increment(1);
                warn!(
                    item_id = %updated.id,
                    error_code = ?updated.last_error_code,
                    "Item dead-lettered"
                );
                Ok(ItemResult::DeadLettered)
            }
        }
    }
}
