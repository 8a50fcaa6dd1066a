//! Integration tests for the durable sync queue: idempotent enqueue,
//! dependency-gated claiming, and the retry/dead-letter transitions.

mod test_utils;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use sea_orm::{ActiveModelTrait, Set};
use serde_json::json;

use regsync::config::RetryPolicyConfig;
use regsync::models::queue_item;
use regsync::models::{Direction, EntityType, JobDirection, Operation, item_status};
use regsync::registry::AdapterError;
use regsync::repositories::queue::{EnqueueRequest, FailureDisposition, QueueRepository};
use regsync::repositories::{DeadLetterRepository, SyncJobRepository};
use test_utils::{create_test_license, setup_test_db, test_crypto_key};

fn enqueue_request(license_id: uuid::Uuid, entity_ref: &str) -> EnqueueRequest {
    EnqueueRequest {
        license_id,
        job_id: None,
        entity_type: EntityType::Package,
        entity_ref: entity_ref.to_string(),
        operation: Operation::Update,
        direction: Direction::Push,
        payload: Some(json!({ "ref": entity_ref })),
        priority: 50,
        depends_on_item_id: None,
    }
}

fn fast_policy() -> RetryPolicyConfig {
    RetryPolicyConfig {
        max_attempts: 2,
        max_item_age_hours: 72,
        base_seconds: 1,
        max_seconds: 10,
        jitter_factor: 0.0,
    }
}

#[tokio::test]
async fn enqueue_deduplicates_against_live_items() {
    let db = setup_test_db().await.unwrap();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-Q1")
        .await
        .unwrap();
    let queue = QueueRepository::new(db);

    let first = queue
        .enqueue(enqueue_request(license.id, "PKG-1"))
        .await
        .unwrap();
    assert!(first.is_created());

    let second = queue
        .enqueue(enqueue_request(license.id, "PKG-1"))
        .await
        .unwrap();
    assert!(!second.is_created());
    assert_eq!(second.item().id, first.item().id);

    // A terminal item no longer absorbs new enqueues for the same change.
    let claimed = queue.ready_batch(license.id, 10).await.unwrap();
    queue.mark_succeeded(claimed[0].clone()).await.unwrap();

    let third = queue
        .enqueue(enqueue_request(license.id, "PKG-1"))
        .await
        .unwrap();
    assert!(third.is_created());
    assert_ne!(third.item().id, first.item().id);
}

#[tokio::test]
async fn ready_batch_claims_by_priority_and_marks_processing() {
    let db = setup_test_db().await.unwrap();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-Q2")
        .await
        .unwrap();
    let queue = QueueRepository::new(db);

    let mut low = enqueue_request(license.id, "PKG-LOW");
    low.priority = 90;
    let mut high = enqueue_request(license.id, "PKG-HIGH");
    high.priority = 10;
    queue.enqueue(low).await.unwrap();
    queue.enqueue(high).await.unwrap();

    let batch = queue.ready_batch(license.id, 1).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].entity_ref, "PKG-HIGH");
    assert_eq!(batch[0].status, item_status::PROCESSING);

    // A claimed item is not handed out twice.
    let batch = queue.ready_batch(license.id, 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].entity_ref, "PKG-LOW");
}

#[tokio::test]
async fn ready_batch_gates_on_predecessor_success() {
    let db = setup_test_db().await.unwrap();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-Q3")
        .await
        .unwrap();
    let queue = QueueRepository::new(db);

    let package = queue
        .enqueue(enqueue_request(license.id, "PKG-PARENT"))
        .await
        .unwrap();
    let mut transfer = enqueue_request(license.id, "TRF-CHILD");
    transfer.entity_type = EntityType::Transfer;
    transfer.depends_on_item_id = Some(package.item().id);
    queue.enqueue(transfer).await.unwrap();

    // Only the predecessor is claimable while it has not succeeded.
    let batch = queue.ready_batch(license.id, 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].entity_ref, "PKG-PARENT");

    queue.mark_succeeded(batch[0].clone()).await.unwrap();

    let batch = queue.ready_batch(license.id, 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].entity_ref, "TRF-CHILD");
}

#[tokio::test]
async fn enqueue_rejects_dependency_on_unknown_item() {
    let db = setup_test_db().await.unwrap();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-Q10")
        .await
        .unwrap();
    let queue = QueueRepository::new(db);

    let mut request = enqueue_request(license.id, "TRF-ORPHAN");
    request.depends_on_item_id = Some(uuid::Uuid::new_v4());

    let err = queue.enqueue(request).await.unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
    assert_eq!(err.code, Box::from("VALIDATION_FAILED"));
}

#[tokio::test]
async fn enqueue_rejects_dependency_across_licenses() {
    let db = setup_test_db().await.unwrap();
    let key = test_crypto_key();
    let theirs = create_test_license(&db, &key, "CUL-Q11A").await.unwrap();
    let ours = create_test_license(&db, &key, "CUL-Q11B").await.unwrap();
    let queue = QueueRepository::new(db);

    let foreign = queue
        .enqueue(enqueue_request(theirs.id, "PKG-THEIRS"))
        .await
        .unwrap();

    let mut request = enqueue_request(ours.id, "TRF-OURS");
    request.depends_on_item_id = Some(foreign.item().id);

    let err = queue.enqueue(request).await.unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);

    // Nothing was inserted for the rejected request.
    let batch = queue.ready_batch(ours.id, 10).await.unwrap();
    assert!(batch.is_empty());
}

#[tokio::test]
async fn blocked_dependents_do_not_starve_their_predecessor() {
    let db = setup_test_db().await.unwrap();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-Q12")
        .await
        .unwrap();
    let queue = QueueRepository::new(db);

    // The predecessor sorts last; every dependent sorts ahead of it.
    let mut base = enqueue_request(license.id, "PKG-BASE");
    base.priority = 90;
    let base = queue.enqueue(base).await.unwrap();

    for n in 0..5 {
        let mut dependent = enqueue_request(license.id, &format!("TRF-DEP-{n}"));
        dependent.entity_type = EntityType::Transfer;
        dependent.priority = 10;
        dependent.depends_on_item_id = Some(base.item().id);
        queue.enqueue(dependent).await.unwrap();
    }

    // A small batch must still reach past the blocked dependents.
    let batch = queue.ready_batch(license.id, 2).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].entity_ref, "PKG-BASE");

    queue.mark_succeeded(batch[0].clone()).await.unwrap();
    let batch = queue.ready_batch(license.id, 2).await.unwrap();
    assert_eq!(batch.len(), 2);
}

#[tokio::test]
async fn ready_batch_skips_items_scheduled_in_the_future() {
    let db = setup_test_db().await.unwrap();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-Q4")
        .await
        .unwrap();
    let queue = QueueRepository::new(db.clone());

    let outcome = queue
        .enqueue(enqueue_request(license.id, "PKG-LATER"))
        .await
        .unwrap();

    let mut active: queue_item::ActiveModel = outcome.item().clone().into();
    active.scheduled_at = Set((Utc::now() + Duration::hours(1)).fixed_offset());
    active.update(&db).await.unwrap();

    let batch = queue.ready_batch(license.id, 10).await.unwrap();
    assert!(batch.is_empty());
}

#[tokio::test]
async fn retryable_failures_reschedule_until_attempts_exhaust() {
    let db = setup_test_db().await.unwrap();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-Q5")
        .await
        .unwrap();
    let queue = QueueRepository::new(db.clone());
    let policy = fast_policy();
    let error = AdapterError::transient("connection reset");

    queue
        .enqueue(enqueue_request(license.id, "PKG-RETRY"))
        .await
        .unwrap();

    // First two failures consume the attempt budget.
    for expected_attempts in 1..=policy.max_attempts {
        queue.promote_due_retries(license.id).await.unwrap();
        let item = claimed_item(&queue, license.id).await;
        let (updated, disposition) = queue.mark_failed(item, &error, &policy).await.unwrap();
        assert_eq!(updated.attempts, expected_attempts);
        assert_eq!(updated.status, item_status::FAILED);
        assert!(matches!(disposition, FailureDisposition::Rescheduled { .. }));
        make_due_now(&db, &updated).await;
    }

    // The next failure exceeds max_attempts and dead-letters the item.
    queue.promote_due_retries(license.id).await.unwrap();
    let item = claimed_item(&queue, license.id).await;
    let (updated, disposition) = queue.mark_failed(item, &error, &policy).await.unwrap();
    assert_eq!(updated.status, item_status::FAILED_PERMANENT);
    assert_eq!(updated.attempts, policy.max_attempts + 1);
    assert!(updated.failed_at.is_some());
    assert_eq!(disposition, FailureDisposition::DeadLettered);
}

#[tokio::test]
async fn non_retryable_failure_dead_letters_without_consuming_attempts() {
    let db = setup_test_db().await.unwrap();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-Q6")
        .await
        .unwrap();
    let queue = QueueRepository::new(db);
    let policy = fast_policy();

    queue
        .enqueue(enqueue_request(license.id, "PKG-REJECTED"))
        .await
        .unwrap();
    let batch = queue.ready_batch(license.id, 1).await.unwrap();

    let error = AdapterError::permanent("unknown entity");
    let (updated, disposition) = queue
        .mark_failed(batch[0].clone(), &error, &policy)
        .await
        .unwrap();

    assert_eq!(disposition, FailureDisposition::DeadLettered);
    assert_eq!(updated.status, item_status::FAILED_PERMANENT);
    // No retry was consumed.
    assert_eq!(updated.attempts, 0);
    assert_eq!(updated.last_error_code.as_deref(), Some("PERMANENT"));
}

#[tokio::test]
async fn rate_limit_hint_sets_the_backoff_floor() {
    let db = setup_test_db().await.unwrap();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-Q7")
        .await
        .unwrap();
    let queue = QueueRepository::new(db);
    let policy = fast_policy();

    queue
        .enqueue(enqueue_request(license.id, "PKG-THROTTLED"))
        .await
        .unwrap();
    let batch = queue.ready_batch(license.id, 1).await.unwrap();

    let before = Utc::now();
    let error = AdapterError::rate_limited(Some(300));
    let (updated, _) = queue
        .mark_failed(batch[0].clone(), &error, &policy)
        .await
        .unwrap();

    let delay = (updated.scheduled_at.with_timezone(&Utc) - before).num_seconds();
    assert!(delay >= 299, "delay {} shorter than the hint", delay);
    assert_eq!(updated.last_error_code.as_deref(), Some("RATE_LIMITED"));
}

#[tokio::test]
async fn cancelling_a_job_dead_letters_its_queued_items() {
    let db = setup_test_db().await.unwrap();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-Q8")
        .await
        .unwrap();
    let jobs = SyncJobRepository::new(db.clone());
    let queue = QueueRepository::new(db);

    let job = jobs
        .start_job(license.id, JobDirection::Push, &[EntityType::Package])
        .await
        .unwrap();

    let mut queued = enqueue_request(license.id, "PKG-CANCEL-1");
    queued.job_id = Some(job.id);
    queue.enqueue(queued).await.unwrap();
    let mut in_flight = enqueue_request(license.id, "PKG-CANCEL-2");
    in_flight.job_id = Some(job.id);
    queue.enqueue(in_flight).await.unwrap();

    // One item is mid-attempt when the cancel lands.
    let batch = queue.ready_batch(license.id, 1).await.unwrap();
    assert_eq!(batch.len(), 1);

    let cancelled = queue.cancel_items_for_job(job.id).await.unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].status, item_status::FAILED_PERMANENT);
    assert_eq!(cancelled[0].last_error_code.as_deref(), Some("CANCELLED"));

    // The in-flight item was left to finish its attempt.
    let survivor = queue.find_by_id(batch[0].id).await.unwrap().unwrap();
    assert_eq!(survivor.status, item_status::PROCESSING);
}

#[tokio::test]
async fn retry_failed_resets_a_jobs_failed_and_dead_lettered_items() {
    let db = setup_test_db().await.unwrap();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-Q13")
        .await
        .unwrap();
    let jobs = SyncJobRepository::new(db.clone());
    let queue = QueueRepository::new(db.clone());
    let dead_letter = DeadLetterRepository::new(db);
    let policy = fast_policy();

    let job = jobs
        .start_job(license.id, JobDirection::Push, &[EntityType::Package])
        .await
        .unwrap();

    for entity_ref in ["PKG-SOFT", "PKG-HARD", "PKG-DONE"] {
        let mut request = enqueue_request(license.id, entity_ref);
        request.job_id = Some(job.id);
        queue.enqueue(request).await.unwrap();
    }
    let batch = queue.ready_batch(license.id, 10).await.unwrap();
    assert_eq!(batch.len(), 3);

    let mut dead_lettered_id = None;
    let mut dismissed_id = None;
    for item in batch {
        match item.entity_ref.as_str() {
            "PKG-SOFT" => {
                let error = AdapterError::transient("connection reset");
                queue.mark_failed(item, &error, &policy).await.unwrap();
            }
            "PKG-HARD" => {
                let error = AdapterError::permanent("unknown entity");
                let (updated, _) = queue.mark_failed(item, &error, &policy).await.unwrap();
                dead_lettered_id = Some(updated.id);
            }
            _ => {
                let error = AdapterError::permanent("stale payload");
                let (updated, _) = queue.mark_failed(item, &error, &policy).await.unwrap();
                dead_letter
                    .dismiss(updated.id, "superseded upstream".to_string())
                    .await
                    .unwrap();
                dismissed_id = Some(updated.id);
            }
        }
    }

    let retried = queue.retry_failed(job.id).await.unwrap();
    assert_eq!(retried.len(), 2);
    for item in &retried {
        assert_eq!(item.status, item_status::PENDING);
        assert_eq!(item.attempts, 0);
        assert!(item.failed_at.is_none());
    }

    // The dismissed item is final.
    let dismissed = queue
        .find_by_id(dismissed_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dismissed.status, item_status::DISMISSED);

    // A dead-lettered item shadowed by a newer live item is left alone.
    let batch = queue.ready_batch(license.id, 10).await.unwrap();
    assert_eq!(batch.len(), 2);
    for item in batch {
        let error = AdapterError::permanent("unknown entity");
        queue.mark_failed(item, &error, &policy).await.unwrap();
    }
    queue
        .enqueue(enqueue_request(license.id, "PKG-HARD"))
        .await
        .unwrap();

    let retried = queue.retry_failed(job.id).await.unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].entity_ref, "PKG-SOFT");
    let shadowed = queue
        .find_by_id(dead_lettered_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(shadowed.status, item_status::FAILED_PERMANENT);
}

#[tokio::test]
async fn stale_processing_items_are_recovered_to_pending() {
    let db = setup_test_db().await.unwrap();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-Q9")
        .await
        .unwrap();
    let queue = QueueRepository::new(db.clone());

    queue
        .enqueue(enqueue_request(license.id, "PKG-STUCK"))
        .await
        .unwrap();
    let batch = queue.ready_batch(license.id, 1).await.unwrap();

    // Age the claim past the recovery horizon.
    let mut active: queue_item::ActiveModel = batch[0].clone().into();
    active.updated_at = Set((Utc::now() - Duration::hours(1)).fixed_offset());
    active.update(&db).await.unwrap();

    let recovered = queue.recover_stale_processing(120).await.unwrap();
    assert_eq!(recovered, 1);

    let item = queue.find_by_id(batch[0].id).await.unwrap().unwrap();
    assert_eq!(item.status, item_status::PENDING);
}

async fn claimed_item(
    queue: &QueueRepository,
    license_id: uuid::Uuid,
) -> regsync::models::queue_item::Model {
    let batch = queue.ready_batch(license_id, 1).await.unwrap();
    assert_eq!(batch.len(), 1, "expected one claimable item");
    batch[0].clone()
}

/// Rewind a rescheduled item's backoff so the next claim sees it.
async fn make_due_now(db: &sea_orm::DatabaseConnection, item: &queue_item::Model) {
    let mut active: queue_item::ActiveModel = item.clone().into();
    active.scheduled_at = Set((Utc::now() - Duration::seconds(1)).fixed_offset());
    active.update(db).await.unwrap();
}
