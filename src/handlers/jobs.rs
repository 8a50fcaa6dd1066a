//! # Jobs API Handlers
//!
//! Handlers for starting, inspecting, and cancelling sync jobs, and for
//! enqueueing individual units of sync work.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::audit::{AuditRecord, outcome};
use crate::auth::{OperatorAuth, OperatorIdentity};
use crate::error::{ApiError, validation_error};
use crate::models::sync_job;
use crate::models::{Direction, EntityType, JobDirection, Operation};
use crate::repositories::queue::EnqueueRequest;
use crate::repositories::{LicenseRepository, QueueRepository, SyncJobRepository};
use crate::server::AppState;

/// Request payload for starting a sync job
#[derive(Debug, Deserialize, ToSchema)]
pub struct StartSyncRequest {
    /// Direction of the run (push, pull, both); defaults to both
    pub direction: Option<String>,
    /// Entity types to sync; all types when omitted
    pub entity_types: Option<Vec<String>>,
}

/// Request payload for cancelling a job
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CancelJobRequest {
    /// Optional reason recorded on the job
    pub reason: Option<String>,
}

/// Request payload for enqueueing one unit of sync work
#[derive(Debug, Deserialize, ToSchema)]
pub struct EnqueueItemRequest {
    /// Entity type (plant, harvest, package, transfer, lab_result)
    #[schema(example = "package")]
    pub entity_type: String,
    /// Stable reference to the entity instance
    #[schema(example = "PKG-2024-0001")]
    pub entity_ref: String,
    /// Operation (create, update)
    #[schema(example = "update")]
    pub operation: String,
    /// Direction (push, pull); defaults to push
    pub direction: Option<String>,
    /// Opaque operation body
    pub payload: Option<serde_json::Value>,
    /// Scheduling priority; lower runs sooner (default 50)
    pub priority: Option<i16>,
    /// Item that must succeed before this one runs
    pub depends_on_item_id: Option<Uuid>,
}

/// Sync job information response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobInfo {
    pub id: String,
    pub license_id: String,
    #[schema(example = "both")]
    pub direction: String,
    pub entity_types: serde_json::Value,
    #[schema(example = "processing")]
    pub status: String,
    pub items_enqueued: i32,
    pub items_succeeded: i32,
    pub items_failed: i32,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<serde_json::Value>,
    pub created_at: String,
}

impl From<sync_job::Model> for JobInfo {
    fn from(model: sync_job::Model) -> Self {
        Self {
            id: model.id.to_string(),
            license_id: model.license_id.to_string(),
            direction: model.direction,
            entity_types: model.entity_types,
            status: model.status,
            items_enqueued: model.items_enqueued,
            items_succeeded: model.items_succeeded,
            items_failed: model.items_failed,
            started_at: model.started_at.map(|dt| dt.to_rfc3339()),
            finished_at: model.finished_at.map(|dt| dt.to_rfc3339()),
            error: model.error,
            created_at: model.created_at.to_rfc3339(),
        }
    }
}

/// Queue item acknowledgement
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EnqueueItemResponse {
    /// ID of the live queue item for this change
    pub item_id: String,
    /// False when an existing live item absorbed the enqueue
    pub created: bool,
}

/// Response for a job-scoped retry of failed items
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RetryFailedResponse {
    /// Number of items reset to pending
    pub retried: u64,
}

/// Query parameters for listing jobs
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    /// Filter by job status
    pub status: Option<String>,
    /// Maximum number of jobs to return (default 50)
    pub limit: Option<u64>,
    /// Offset for pagination
    pub offset: Option<u64>,
}

fn parse_entity_types(names: Option<&Vec<String>>) -> Result<Vec<EntityType>, ApiError> {
    match names {
        None => Ok(EntityType::ALL.to_vec()),
        Some(names) if names.is_empty() => Err(validation_error(
            "Entity types must not be empty",
            serde_json::json!({ "entity_types": "Provide at least one entity type" }),
        )),
        Some(names) => names
            .iter()
            .map(|name| {
                EntityType::parse(name).ok_or_else(|| {
                    validation_error(
                        "Unknown entity type",
                        serde_json::json!({ "entity_types": name }),
                    )
                })
            })
            .collect(),
    }
}

/// Start a sync job for a license
#[utoipa::path(
    post,
    path = "/licenses/{license_id}/sync",
    security(("bearer_auth" = [])),
    params(("license_id" = Uuid, Path, description = "License ID")),
    request_body = StartSyncRequest,
    responses(
        (status = 202, description = "Sync job started", body = JobInfo),
        (status = 400, description = "Invalid request body", body = ApiError),
        (status = 404, description = "License not found", body = ApiError),
        (status = 409, description = "A sync job is already running", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn start_sync(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(license_id): Path<Uuid>,
    Json(request): Json<StartSyncRequest>,
) -> Result<(StatusCode, Json<JobInfo>), ApiError> {
    let license = LicenseRepository::new(state.db.clone())
        .find_by_id(license_id)
        .await?
        .ok_or_else(|| crate::error::not_found("License not found"))?;
    if !license.active {
        return Err(crate::error::conflict("License is not active"));
    }

    let direction = match request.direction.as_deref() {
        None => JobDirection::Both,
        Some(value) => JobDirection::parse(value).ok_or_else(|| {
            validation_error(
                "Unknown direction",
                serde_json::json!({ "direction": value }),
            )
        })?,
    };
    let entity_types = parse_entity_types(request.entity_types.as_ref())?;

    let job = SyncJobRepository::new(state.db.clone())
        .start_job(license_id, direction, &entity_types)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(job.into())))
}

/// Get one sync job
#[utoipa::path(
    get,
    path = "/jobs/{job_id}",
    security(("bearer_auth" = [])),
    params(("job_id" = Uuid, Path, description = "Sync job ID")),
    responses(
        (status = 200, description = "Sync job details", body = JobInfo),
        (status = 404, description = "Sync job not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobInfo>, ApiError> {
    let job = SyncJobRepository::new(state.db.clone())
        .find_by_id(job_id)
        .await?
        .ok_or_else(|| crate::error::not_found("Sync job not found"))?;
    Ok(Json(job.into()))
}

/// List sync jobs for a license, newest first
#[utoipa::path(
    get,
    path = "/licenses/{license_id}/jobs",
    security(("bearer_auth" = [])),
    params(
        ("license_id" = Uuid, Path, description = "License ID"),
        ("status" = Option<String>, Query, description = "Filter by job status"),
        ("limit" = Option<u64>, Query, description = "Maximum number of jobs to return"),
        ("offset" = Option<u64>, Query, description = "Offset for pagination")
    ),
    responses(
        (status = 200, description = "Sync jobs for the license", body = [JobInfo]),
        (status = 404, description = "License not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(license_id): Path<Uuid>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobInfo>>, ApiError> {
    LicenseRepository::new(state.db.clone())
        .find_by_id(license_id)
        .await?
        .ok_or_else(|| crate::error::not_found("License not found"))?;

    let jobs = SyncJobRepository::new(state.db.clone())
        .list_by_license(license_id, query.status, query.limit, query.offset)
        .await?;
    Ok(Json(jobs.into_iter().map(Into::into).collect()))
}

/// Cancel a pending or processing sync job
///
/// In-flight items finish their current attempt; remaining queued items are
/// dead-lettered with code `CANCELLED`.
#[utoipa::path(
    post,
    path = "/jobs/{job_id}/cancel",
    security(("bearer_auth" = [])),
    params(("job_id" = Uuid, Path, description = "Sync job ID")),
    request_body = CancelJobRequest,
    responses(
        (status = 200, description = "Cancelled sync job", body = JobInfo),
        (status = 404, description = "Sync job not found", body = ApiError),
        (status = 409, description = "Job already in a terminal state", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(job_id): Path<Uuid>,
    Json(request): Json<CancelJobRequest>,
) -> Result<Json<JobInfo>, ApiError> {
    let cancelled = SyncJobRepository::new(state.db.clone())
        .cancel(job_id, request.reason)
        .await?;

    let dead_lettered = QueueRepository::new(state.db.clone())
        .cancel_items_for_job(job_id)
        .await?;
    for item in &dead_lettered {
        let record = crate::audit::AuditRecord::for_item(item, crate::audit::outcome::FAILED_PERMANENT);
        if let Err(err) = state.audit.record(record).await {
            tracing::warn!(error = ?err, "Failed to write audit record");
        }
    }

    Ok(Json(cancelled.into()))
}

/// Retry the failed items of one job
///
/// Resets the job's failed and dead-lettered items to pending with a fresh
/// attempt budget. Dismissed items stay put, as do dead-lettered items whose
/// change already has a newer live item.
#[utoipa::path(
    post,
    path = "/jobs/{job_id}/retry-failed",
    security(("bearer_auth" = [])),
    params(("job_id" = Uuid, Path, description = "Sync job ID")),
    responses(
        (status = 200, description = "Failed items reset to pending", body = RetryFailedResponse),
        (status = 404, description = "Sync job not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn retry_failed(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    OperatorIdentity(actor): OperatorIdentity,
    Path(job_id): Path<Uuid>,
) -> Result<Json<RetryFailedResponse>, ApiError> {
    SyncJobRepository::new(state.db.clone())
        .find_by_id(job_id)
        .await?
        .ok_or_else(|| crate::error::not_found("Sync job not found"))?;

    let items = QueueRepository::new(state.db.clone())
        .retry_failed(job_id)
        .await?;

    for item in &items {
        let mut record = AuditRecord::for_item(item, outcome::RETRIED);
        if let Some(actor) = actor.as_ref() {
            record = record.with_actor(actor.clone());
        }
        if let Err(err) = state.audit.record(record).await {
            tracing::warn!(error = ?err, "Failed to write audit record");
        }
    }

    Ok(Json(RetryFailedResponse {
        retried: items.len() as u64,
    }))
}

/// Enqueue one unit of sync work
///
/// Enqueueing is idempotent: a live item for the same (entity type, entity
/// ref, operation) absorbs the request.
#[utoipa::path(
    post,
    path = "/licenses/{license_id}/queue/items",
    security(("bearer_auth" = [])),
    params(("license_id" = Uuid, Path, description = "License ID")),
    request_body = EnqueueItemRequest,
    responses(
        (status = 200, description = "Existing live item absorbed the enqueue", body = EnqueueItemResponse),
        (status = 201, description = "Queue item created", body = EnqueueItemResponse),
        (status = 400, description = "Invalid request body", body = ApiError),
        (status = 404, description = "License not found", body = ApiError)
    ),
    tag = "queue"
)]
pub async fn enqueue_item(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(license_id): Path<Uuid>,
    Json(request): Json<EnqueueItemRequest>,
) -> Result<(StatusCode, Json<EnqueueItemResponse>), ApiError> {
    LicenseRepository::new(state.db.clone())
        .find_by_id(license_id)
        .await?
        .ok_or_else(|| crate::error::not_found("License not found"))?;

    let entity_type = EntityType::parse(&request.entity_type).ok_or_else(|| {
        validation_error(
            "Unknown entity type",
            serde_json::json!({ "entity_type": request.entity_type }),
        )
    })?;
    let operation = Operation::parse(&request.operation).ok_or_else(|| {
        validation_error(
            "Unknown operation",
            serde_json::json!({ "operation": request.operation }),
        )
    })?;
    let direction = match request.direction.as_deref() {
        None => Direction::Push,
        Some(value) => Direction::parse(value).ok_or_else(|| {
            validation_error(
                "Unknown direction",
                serde_json::json!({ "direction": value }),
            )
        })?,
    };
    if request.entity_ref.trim().is_empty() {
        return Err(validation_error(
            "Invalid entity reference",
            serde_json::json!({ "entity_ref": "Must not be empty" }),
        ));
    }

    let outcome = QueueRepository::new(state.db.clone())
        .enqueue(EnqueueRequest {
            license_id,
            job_id: None,
            entity_type,
            entity_ref: request.entity_ref,
            operation,
            direction,
            payload: request.payload,
            priority: request.priority.unwrap_or(50),
            depends_on_item_id: request.depends_on_item_id,
        })
        .await?;

    let created = outcome.is_created();
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(EnqueueItemResponse {
            item_id: outcome.item().id.to_string(),
            created,
        }),
    ))
}
