//! # Dead-Letter API Handlers
//!
//! Handlers for inspecting and resolving permanently failed queue items.
//! Manual retries and dismissals are audited with the acting operator.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::audit::{AuditRecord, outcome};
use crate::auth::{OperatorAuth, OperatorIdentity};
use crate::error::{ApiError, validation_error};
use crate::models::queue_item;
use crate::repositories::DeadLetterRepository;
use crate::repositories::dead_letter::DeadLetterFilter;
use crate::server::AppState;

/// Dead-lettered item information response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeadLetterItemInfo {
    pub id: String,
    pub license_id: String,
    pub job_id: Option<String>,
    #[schema(example = "package")]
    pub entity_type: String,
    #[schema(example = "PKG-2024-0001")]
    pub entity_ref: String,
    pub operation: String,
    pub direction: String,
    pub attempts: i32,
    #[schema(example = "PERMANENT")]
    pub last_error_code: Option<String>,
    pub last_error: Option<serde_json::Value>,
    pub failed_at: Option<String>,
    pub created_at: String,
}

impl From<queue_item::Model> for DeadLetterItemInfo {
    fn from(model: queue_item::Model) -> Self {
        Self {
            id: model.id.to_string(),
            license_id: model.license_id.to_string(),
            job_id: model.job_id.map(|id| id.to_string()),
            entity_type: model.entity_type,
            entity_ref: model.entity_ref,
            operation: model.operation,
            direction: model.direction,
            attempts: model.attempts,
            last_error_code: model.last_error_code,
            last_error: model.last_error,
            failed_at: model.failed_at.map(|dt| dt.to_rfc3339()),
            created_at: model.created_at.to_rfc3339(),
        }
    }
}

/// Query parameters for listing dead-lettered items
#[derive(Debug, Deserialize)]
pub struct ListDeadLetterQuery {
    /// Filter by license ID
    pub license_id: Option<Uuid>,
    /// Filter by entity type
    pub entity_type: Option<String>,
    /// Filter by last error code
    pub error_code: Option<String>,
    /// Maximum number of items to return (default 50)
    pub limit: Option<u64>,
    /// Offset for pagination
    pub offset: Option<u64>,
}

/// Request payload for dismissing an item
#[derive(Debug, Deserialize, ToSchema)]
pub struct DismissRequest {
    /// Operator notes explaining the dismissal (required)
    pub notes: String,
}

/// Response for a bulk retry
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RetryAllResponse {
    /// Number of items re-enqueued
    pub retried: u64,
}

/// List dead-lettered items
#[utoipa::path(
    get,
    path = "/dead-letter",
    security(("bearer_auth" = [])),
    params(
        ("license_id" = Option<Uuid>, Query, description = "Filter by license ID"),
        ("entity_type" = Option<String>, Query, description = "Filter by entity type"),
        ("error_code" = Option<String>, Query, description = "Filter by last error code"),
        ("limit" = Option<u64>, Query, description = "Maximum number of items to return"),
        ("offset" = Option<u64>, Query, description = "Offset for pagination")
    ),
    responses(
        (status = 200, description = "Dead-lettered items", body = [DeadLetterItemInfo]),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "dead-letter"
)]
pub async fn list_dead_letter(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Query(query): Query<ListDeadLetterQuery>,
) -> Result<Json<Vec<DeadLetterItemInfo>>, ApiError> {
    let items = DeadLetterRepository::new(state.db.clone())
        .list(DeadLetterFilter {
            license_id: query.license_id,
            entity_type: query.entity_type,
            error_code: query.error_code,
            limit: query.limit,
            offset: query.offset,
        })
        .await?;
    Ok(Json(items.into_iter().map(Into::into).collect()))
}

/// Re-enqueue one dead-lettered item
#[utoipa::path(
    post,
    path = "/dead-letter/{item_id}/retry",
    security(("bearer_auth" = [])),
    params(("item_id" = Uuid, Path, description = "Queue item ID")),
    responses(
        (status = 200, description = "Item re-enqueued", body = DeadLetterItemInfo),
        (status = 404, description = "Queue item not found", body = ApiError),
        (status = 409, description = "Item is not in the dead letter", body = ApiError)
    ),
    tag = "dead-letter"
)]
pub async fn retry_item(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    OperatorIdentity(actor): OperatorIdentity,
    Path(item_id): Path<Uuid>,
) -> Result<Json<DeadLetterItemInfo>, ApiError> {
    let item = DeadLetterRepository::new(state.db.clone())
        .retry(item_id)
        .await?;

    let mut record = AuditRecord::for_item(&item, outcome::RETRIED);
    if let Some(actor) = actor {
        record = record.with_actor(actor);
    }
    if let Err(err) = state.audit.record(record).await {
        tracing::warn!(error = ?err, "Failed to write audit record");
    }

    Ok(Json(item.into()))
}

/// Re-enqueue every dead-lettered item for a license
#[utoipa::path(
    post,
    path = "/licenses/{license_id}/dead-letter/retry-all",
    security(("bearer_auth" = [])),
    params(("license_id" = Uuid, Path, description = "License ID")),
    responses(
        (status = 200, description = "Items re-enqueued", body = RetryAllResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "dead-letter"
)]
pub async fn retry_all(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    OperatorIdentity(actor): OperatorIdentity,
    Path(license_id): Path<Uuid>,
) -> Result<Json<RetryAllResponse>, ApiError> {
    let items = DeadLetterRepository::new(state.db.clone())
        .retry_all(license_id)
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

    Ok(Json(RetryAllResponse {
        retried: items.len() as u64,
    }))
}

/// Dismiss one dead-lettered item with operator notes
#[utoipa::path(
    post,
    path = "/dead-letter/{item_id}/dismiss",
    security(("bearer_auth" = [])),
    params(("item_id" = Uuid, Path, description = "Queue item ID")),
    request_body = DismissRequest,
    responses(
        (status = 200, description = "Item dismissed", body = DeadLetterItemInfo),
        (status = 400, description = "Notes are required", body = ApiError),
        (status = 404, description = "Queue item not found", body = ApiError),
        (status = 409, description = "Item is not in the dead letter", body = ApiError)
    ),
    tag = "dead-letter"
)]
pub async fn dismiss_item(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    OperatorIdentity(actor): OperatorIdentity,
    Path(item_id): Path<Uuid>,
    Json(request): Json<DismissRequest>,
) -> Result<Json<DeadLetterItemInfo>, ApiError> {
    if request.notes.trim().is_empty() {
        return Err(validation_error(
            "Dismissal notes are required",
            serde_json::json!({ "notes": "Must not be empty" }),
        ));
    }

    let item = DeadLetterRepository::new(state.db.clone())
        .dismiss(item_id, request.notes.clone())
        .await?;

    let mut record = AuditRecord::for_item(&item, outcome::DISMISSED)
        .with_detail(serde_json::json!({ "notes": request.notes }));
    if let Some(actor) = actor {
        record = record.with_actor(actor);
    }
    if let Err(err) = state.audit.record(record).await {
        tracing::warn!(error = ?err, "Failed to write audit record");
    }

    Ok(Json(item.into()))
}
