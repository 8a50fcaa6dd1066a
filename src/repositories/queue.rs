//! # Queue Repository
//!
//! Repository operations for the `queue_items` table: idempotent enqueue,
//! atomic batch claiming, and the retry/dead-letter transitions. This is
//! the durability core of the engine; every transition here must hold
//! across crashes and concurrent drive loops.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::RetryPolicyConfig;
use crate::error::{ApiError, internal_db_error, is_unique_violation};
use crate::models::queue_item::{ActiveModel, Column, Entity, Model};
use crate::models::{Direction, EntityType, Operation, item_status};
use crate::registry::AdapterError;

/// Deterministic idempotency key for one logical change.
///
/// Two enqueues of the same (entity type, entity ref, operation) map to the
/// same key, so at most one live item exists per change.
pub fn idempotency_key(entity_type: EntityType, entity_ref: &str, operation: Operation) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_type.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(entity_ref.as_bytes());
    hasher.update(b":");
    hasher.update(operation.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Fields accepted when enqueueing a unit of sync work.
pub struct EnqueueRequest {
    pub license_id: Uuid,
    pub job_id: Option<Uuid>,
    pub entity_type: EntityType,
    pub entity_ref: String,
    pub operation: Operation,
    pub direction: Direction,
    pub payload: Option<JsonValue>,
    pub priority: i16,
    pub depends_on_item_id: Option<Uuid>,
}

/// Outcome of an enqueue call.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// A new queue item was created.
    Created(Model),
    /// A live item with the same idempotency key already existed.
    Existing(Model),
}

impl EnqueueOutcome {
    pub fn item(&self) -> &Model {
        match self {
            EnqueueOutcome::Created(item) | EnqueueOutcome::Existing(item) => item,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

/// Disposition decided by [`QueueRepository::mark_failed`].
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    /// Retryable; the item was rescheduled with backoff.
    Rescheduled {
        next_at: chrono::DateTime<chrono::FixedOffset>,
    },
    /// Retries exhausted or error not retryable; the item is dead-lettered.
    DeadLettered,
}

/// Compute the backoff delay before the next attempt.
///
/// Exponential in the attempt count, capped, with symmetric jitter. A
/// registry retry-after hint overrides the computed floor when larger.
pub fn backoff_delay(policy: &RetryPolicyConfig, attempts: i32, hint_secs: Option<u64>) -> u64 {
    let exponent = attempts.clamp(0, 20) as u32;
    let exponential = policy
        .base_seconds
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(policy.max_seconds);

    let floor = hint_secs.map_or(exponential, |hint| exponential.max(hint));

    let jitter_span = (floor as f64 * policy.jitter_factor) as i64;
    if jitter_span == 0 {
        return floor;
    }
    let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    floor.saturating_add_signed(jitter)
}

/// Repository for queue item database operations
pub struct QueueRepository {
    db: DatabaseConnection,
}

impl QueueRepository {
    /// Create a new QueueRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Enqueue a unit of sync work, deduplicating against live items.
    ///
    /// A pending, processing, or failed item with the same idempotency key
    /// absorbs the enqueue; terminal items never block re-enqueueing the
    /// same change. A racing duplicate insert is caught by the partial
    /// unique index and resolved by re-reading the winner.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome, ApiError> {
        let key = idempotency_key(request.entity_type, &request.entity_ref, request.operation);

        if let Some(existing) = self.find_live_by_key(&key).await? {
            return Ok(EnqueueOutcome::Existing(existing));
        }

        // A dependency must point at a real item of the same license;
        // anything else would gate this item on foreign or phantom work.
        if let Some(predecessor_id) = request.depends_on_item_id {
            let predecessor = self.find_by_id(predecessor_id).await?.ok_or_else(|| {
                crate::error::validation_error(
                    "Unknown dependency item",
                    serde_json::json!({ "depends_on_item_id": predecessor_id }),
                )
            })?;
            if predecessor.license_id != request.license_id {
                return Err(crate::error::validation_error(
                    "Dependency must belong to the same license",
                    serde_json::json!({ "depends_on_item_id": predecessor_id }),
                ));
            }
        }

        let now = Utc::now().fixed_offset();
        let item = ActiveModel {
            id: Set(Uuid::new_v4()),
            job_id: Set(request.job_id),
            license_id: Set(request.license_id),
            entity_type: Set(request.entity_type.as_str().to_string()),
            entity_ref: Set(request.entity_ref),
            operation: Set(request.operation.as_str().to_string()),
            direction: Set(request.direction.as_str().to_string()),
            payload: Set(request.payload),
            idempotency_key: Set(key.clone()),
            status: Set(item_status::PENDING.to_string()),
            priority: Set(request.priority),
            scheduled_at: Set(now),
            depends_on_item_id: Set(request.depends_on_item_id),
            attempts: Set(0),
            last_error_code: Set(None),
            last_error: Set(None),
            dismiss_notes: Set(None),
            failed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match item.insert(&self.db).await {
            Ok(model) => Ok(EnqueueOutcome::Created(model)),
            Err(err) if is_unique_violation(&err) => {
                // Lost the race; the winner is the live item for this key.
                let existing = self.find_live_by_key(&key).await?.ok_or_else(|| {
                    crate::error::conflict("Queue item already exists for this change")
                })?;
                Ok(EnqueueOutcome::Existing(existing))
            }
            Err(err) => Err(internal_db_error("Failed to enqueue item", err)),
        }
    }

    async fn find_live_by_key(&self, key: &str) -> Result<Option<Model>, ApiError> {
        Entity::find()
            .filter(Column::IdempotencyKey.eq(key))
            .filter(Column::Status.is_in(item_status::LIVE))
            .one(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to look up queue item", err))
    }

    /// Find a queue item by ID.
    pub async fn find_by_id(&self, item_id: Uuid) -> Result<Option<Model>, ApiError> {
        Entity::find_by_id(item_id)
            .one(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to find queue item", err))
    }

    /// Atomically claim a batch of ready items for a license.
    ///
    /// An item is ready when it is pending, its scheduled time has passed,
    /// and its predecessor (if any) has succeeded. Claimed items move to
    /// processing inside one transaction so concurrent claimers never hand
    /// out the same item twice.
    pub async fn ready_batch(&self, license_id: Uuid, limit: usize) -> Result<Vec<Model>, ApiError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now().fixed_offset();
        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| internal_db_error("Failed to begin claim transaction", err))?;

        // Page candidates in claim order until the batch fills or the
        // pending set is exhausted, so a run of dependency-gated items
        // cannot starve an eligible item sorted behind them.
        let page_size = (limit * 2) as u64;
        let mut offset = 0u64;
        let mut eligible_ids = Vec::with_capacity(limit);
        loop {
            let candidates = Entity::find()
                .filter(Column::LicenseId.eq(license_id))
                .filter(Column::Status.eq(item_status::PENDING))
                .filter(Column::ScheduledAt.lte(now))
                .order_by_asc(Column::Priority)
                .order_by_asc(Column::ScheduledAt)
                .order_by_asc(Column::CreatedAt)
                .offset(offset)
                .limit(page_size)
                .all(&txn)
                .await
                .map_err(|err| internal_db_error("Failed to select ready items", err))?;
            let fetched = candidates.len();

            for candidate in &candidates {
                if eligible_ids.len() == limit {
                    break;
                }
                match candidate.depends_on_item_id {
                    None => eligible_ids.push(candidate.id),
                    Some(predecessor_id) => {
                        let predecessor = Entity::find_by_id(predecessor_id)
                            .one(&txn)
                            .await
                            .map_err(|err| internal_db_error("Failed to check predecessor", err))?;
                        // Enqueue validates dependencies, so a missing
                        // predecessor row no longer gates the item.
                        let satisfied = predecessor
                            .map(|p| p.status == item_status::SUCCEEDED)
                            .unwrap_or(true);
                        if satisfied {
                            eligible_ids.push(candidate.id);
                        }
                    }
                }
            }

            if eligible_ids.len() == limit || fetched < page_size as usize {
                break;
            }
            offset += page_size;
        }

        if eligible_ids.is_empty() {
            txn.commit()
                .await
                .map_err(|err| internal_db_error("Failed to commit claim transaction", err))?;
            return Ok(Vec::new());
        }

        Entity::update_many()
            .col_expr(Column::Status, item_status::PROCESSING.into())
            .col_expr(Column::UpdatedAt, now.into())
            .filter(Column::Id.is_in(eligible_ids.clone()))
            .filter(Column::Status.eq(item_status::PENDING))
            .exec(&txn)
            .await
            .map_err(|err| internal_db_error("Failed to claim ready items", err))?;

        let claimed = Entity::find()
            .filter(Column::Id.is_in(eligible_ids))
            .filter(Column::Status.eq(item_status::PROCESSING))
            .order_by_asc(Column::Priority)
            .order_by_asc(Column::ScheduledAt)
            .order_by_asc(Column::CreatedAt)
            .all(&txn)
            .await
            .map_err(|err| internal_db_error("Failed to load claimed items", err))?;

        txn.commit()
            .await
            .map_err(|err| internal_db_error("Failed to commit claim transaction", err))?;

        Ok(claimed)
    }

    /// Transition a processing item to succeeded.
    pub async fn mark_succeeded(&self, item: Model) -> Result<Model, ApiError> {
        let now = Utc::now().fixed_offset();
        let mut active: ActiveModel = item.into();
        active.status = Set(item_status::SUCCEEDED.to_string());
        active.updated_at = Set(now);

        active
            .update(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to mark item succeeded", err))
    }

    /// Return a claimed item to pending without consuming an attempt.
    ///
    /// Used when the failure was not the item's fault (license credential
    /// halt, shutdown mid-batch); the item runs again once the license
    /// resumes.
    pub async fn release_to_pending(&self, item: Model) -> Result<Model, ApiError> {
        let mut active: ActiveModel = item.into();
        active.status = Set(item_status::PENDING.to_string());
        active.updated_at = Set(Utc::now().fixed_offset());

        active
            .update(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to release item", err))
    }

    /// Record a failed attempt and decide retry versus dead-letter.
    ///
    /// Retryable errors within the attempt and age budgets reschedule the
    /// item with exponential backoff (attempt count incremented). Everything
    /// else dead-letters it; non-retryable failures leave the attempt count
    /// untouched since no retry was consumed.
    pub async fn mark_failed(
        &self,
        item: Model,
        error: &AdapterError,
        policy: &RetryPolicyConfig,
    ) -> Result<(Model, FailureDisposition), ApiError> {
        let now = Utc::now();
        let age_hours = (now - item.created_at.with_timezone(&Utc)).num_hours();
        let within_age = age_hours < policy.max_item_age_hours;
        let retryable = error.retryable() && item.attempts < policy.max_attempts && within_age;

        let error_json = serde_json::to_value(error).unwrap_or(JsonValue::Null);
        let mut active: ActiveModel = item.clone().into();
        active.last_error_code = Set(Some(error.code().to_string()));
        active.last_error = Set(Some(error_json));
        active.updated_at = Set(now.fixed_offset());

        let disposition = if retryable {
            let hint = match error.kind {
                crate::registry::AdapterErrorKind::RateLimited { retry_after_secs } => {
                    retry_after_secs
                }
                _ => None,
            };
            let delay_secs = backoff_delay(policy, item.attempts, hint);
            let next_at =
                (now + ChronoDuration::seconds(delay_secs as i64)).fixed_offset();

            active.status = Set(item_status::FAILED.to_string());
            active.attempts = Set(item.attempts + 1);
            active.scheduled_at = Set(next_at);
            FailureDisposition::Rescheduled { next_at }
        } else {
            active.status = Set(item_status::FAILED_PERMANENT.to_string());
            active.failed_at = Set(Some(now.fixed_offset()));
            if error.retryable() {
                // Retries exhausted or item too old; the last attempt counts.
                active.attempts = Set(item.attempts + 1);
            }
            FailureDisposition::DeadLettered
        };

        let updated = active
            .update(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to mark item failed", err))?;

        Ok((updated, disposition))
    }

    /// Promote rescheduled (failed) items whose backoff has elapsed back to
    /// pending so the next claim pass picks them up.
    pub async fn promote_due_retries(&self, license_id: Uuid) -> Result<u64, ApiError> {
        let now = Utc::now().fixed_offset();
        let result = Entity::update_many()
            .col_expr(Column::Status, item_status::PENDING.into())
            .col_expr(Column::UpdatedAt, now.into())
            .filter(Column::LicenseId.eq(license_id))
            .filter(Column::Status.eq(item_status::FAILED))
            .filter(Column::ScheduledAt.lte(now))
            .exec(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to promote retries", err))?;
        Ok(result.rows_affected)
    }

    /// Dead-letter the remaining pending and rescheduled items of a
    /// cancelled job. Returns the affected items for auditing.
    pub async fn cancel_items_for_job(&self, job_id: Uuid) -> Result<Vec<Model>, ApiError> {
        let now = Utc::now().fixed_offset();
        let cancelled_error = serde_json::json!({
            "type": "cancelled",
            "message": "Job was cancelled before this item ran",
        });

        let targets = Entity::find()
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Status.is_in([item_status::PENDING, item_status::FAILED]))
            .all(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to list cancellable items", err))?;

        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = targets.iter().map(|item| item.id).collect();
        Entity::update_many()
            .col_expr(Column::Status, item_status::FAILED_PERMANENT.into())
            .col_expr(Column::LastErrorCode, "CANCELLED".into())
            .col_expr(Column::LastError, cancelled_error.into())
            .col_expr(Column::FailedAt, now.into())
            .col_expr(Column::UpdatedAt, now.into())
            .filter(Column::Id.is_in(ids.clone()))
            .filter(Column::Status.is_in([item_status::PENDING, item_status::FAILED]))
            .exec(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to cancel job items", err))?;

        Entity::find()
            .filter(Column::Id.is_in(ids))
            .all(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to reload cancelled items", err))
    }

    /// Reset a job's failed and dead-lettered items to pending with a
    /// fresh attempt budget. Dismissed items stay put, and a dead-lettered
    /// item whose change already has a newer live item is skipped so the
    /// live-key unique index holds. Returns the items that were reset.
    pub async fn retry_failed(&self, job_id: Uuid) -> Result<Vec<Model>, ApiError> {
        let targets = Entity::find()
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Status.is_in([item_status::FAILED, item_status::FAILED_PERMANENT]))
            .all(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to list retryable items", err))?;

        let mut ids = Vec::with_capacity(targets.len());
        for target in &targets {
            if target.status == item_status::FAILED_PERMANENT
                && self.find_live_by_key(&target.idempotency_key).await?.is_some()
            {
                continue;
            }
            ids.push(target.id);
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now().fixed_offset();
        Entity::update_many()
            .col_expr(Column::Status, item_status::PENDING.into())
            .col_expr(Column::Attempts, 0.into())
            .col_expr(Column::ScheduledAt, now.into())
            .col_expr(
                Column::FailedAt,
                sea_orm::Value::ChronoDateTimeWithTimeZone(None).into(),
            )
            .col_expr(Column::UpdatedAt, now.into())
            .filter(Column::Id.is_in(ids.clone()))
            .filter(Column::Status.is_in([item_status::FAILED, item_status::FAILED_PERMANENT]))
            .exec(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to retry job items", err))?;

        Entity::find()
            .filter(Column::Id.is_in(ids))
            .all(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to reload retried items", err))
    }

    /// Recover items stuck in processing past the timeout horizon.
    ///
    /// Only reachable after a crash mid-attempt; a live worker always
    /// resolves its claim. Recovered items return to pending and rely on
    /// registry-side idempotency to absorb any duplicate submission.
    pub async fn recover_stale_processing(&self, older_than_secs: u64) -> Result<u64, ApiError> {
        let horizon =
            (Utc::now() - ChronoDuration::seconds(older_than_secs as i64)).fixed_offset();
        let now = Utc::now().fixed_offset();

        let result = Entity::update_many()
            .col_expr(Column::Status, item_status::PENDING.into())
            .col_expr(Column::UpdatedAt, now.into())
            .filter(Column::Status.eq(item_status::PROCESSING))
            .filter(Column::UpdatedAt.lt(horizon))
            .exec(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to recover stale items", err))?;

        if result.rows_affected > 0 {
            tracing::warn!(
                recovered = result.rows_affected,
                "Recovered queue items stuck in processing"
            );
        }
        Ok(result.rows_affected)
    }

    /// Count of non-terminal items attached to a job. Zero means the job's
    /// work is drained and the job can be finalized.
    pub async fn live_count_for_job(&self, job_id: Uuid) -> Result<u64, ApiError> {
        use sea_orm::PaginatorTrait;

        Entity::find()
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Status.is_in(item_status::LIVE))
            .count(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to count live items", err))
    }

    /// Whether a license has any claimable or rescheduled work.
    pub async fn has_live_items(&self, license_id: Uuid) -> Result<bool, ApiError> {
        use sea_orm::PaginatorTrait;

        let count = Entity::find()
            .filter(Column::LicenseId.eq(license_id))
            .filter(Column::Status.is_in(item_status::LIVE))
            .count(&self.db)
            .await
            .map_err(|err| internal_db_error("Failed to count live items", err))?;
        Ok(count > 0)
    }
}
