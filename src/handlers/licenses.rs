//! # License API Handlers
//!
//! Handlers for registering and managing licenses, plus the per-license
//! status, checkpoint reset, and reconciliation endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::OperatorAuth;
use crate::crypto::encrypt_license_credentials;
use crate::error::{ApiError, validation_error};
use crate::models::license;
use crate::models::{Direction, EntityType};
use crate::reconciliation::{ReconcileSummary, Reconciler};
use crate::repositories::license::{LicenseUpdate, NewLicense};
use crate::repositories::{
    CheckpointRepository, DeadLetterRepository, LicenseRepository, QueueRepository,
    SyncJobRepository,
};
use crate::server::AppState;

/// Request payload for registering a license
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateLicenseRequest {
    /// Regulatory license number
    #[schema(example = "CUL-00042")]
    pub license_number: String,
    /// Site this license belongs to
    pub site_id: Uuid,
    /// Registry API key (stored encrypted)
    pub api_key: String,
    /// Registry user key (stored encrypted)
    pub user_key: String,
    /// Whether the background loop schedules work automatically
    #[serde(default)]
    pub auto_sync_enabled: bool,
    /// Interval between automatic sync runs in seconds
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: i64,
}

fn default_sync_interval() -> i64 {
    900
}

/// Request payload for updating a license
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateLicenseRequest {
    pub active: Option<bool>,
    pub auto_sync_enabled: Option<bool>,
    pub sync_interval_seconds: Option<i64>,
    /// Replacement registry API key; must be sent together with `user_key`
    pub api_key: Option<String>,
    /// Replacement registry user key; must be sent together with `api_key`
    pub user_key: Option<String>,
}

/// License information response (credentials omitted)
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LicenseInfo {
    pub id: String,
    #[schema(example = "CUL-00042")]
    pub license_number: String,
    pub site_id: String,
    pub active: bool,
    pub auto_sync_enabled: bool,
    pub sync_interval_seconds: i64,
    pub last_synced_at: Option<String>,
    /// Non-null when the license is halted (e.g. credential rejection)
    pub last_sync_error: Option<serde_json::Value>,
    pub created_at: String,
}

impl From<license::Model> for LicenseInfo {
    fn from(model: license::Model) -> Self {
        Self {
            id: model.id.to_string(),
            license_number: model.license_number,
            site_id: model.site_id.to_string(),
            active: model.active,
            auto_sync_enabled: model.auto_sync_enabled,
            sync_interval_seconds: model.sync_interval_seconds,
            last_synced_at: model.last_synced_at.map(|dt| dt.to_rfc3339()),
            last_sync_error: model.last_sync_error,
            created_at: model.created_at.to_rfc3339(),
        }
    }
}

/// Aggregated sync status for one license
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LicenseStatus {
    pub license: LicenseInfo,
    /// Queue items awaiting processing (pending + rescheduled)
    pub queue_live: bool,
    /// Permanently failed items awaiting operator action
    pub dead_letter_count: u64,
    /// ID of the currently pending or processing job, if any
    pub active_job_id: Option<String>,
    pub checkpoints: Vec<CheckpointInfo>,
}

/// Checkpoint state for one (entity type, direction) tuple
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CheckpointInfo {
    pub entity_type: String,
    pub direction: String,
    pub cursor: Option<serde_json::Value>,
    pub last_run_at: Option<String>,
    pub last_status: Option<String>,
}

/// Query parameters for listing licenses
#[derive(Debug, Deserialize)]
pub struct ListLicensesQuery {
    /// Only return active licenses
    #[serde(default)]
    pub active_only: bool,
}

/// Request payload for resetting checkpoints
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ResetCheckpointsRequest {
    /// Restrict the reset to one entity type
    pub entity_type: Option<String>,
    /// Restrict the reset to one direction (push, pull)
    pub direction: Option<String>,
}

/// Response for a checkpoint reset
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ResetCheckpointsResponse {
    /// Number of checkpoints cleared
    pub cleared: u64,
}

/// Request payload for a reconciliation pass
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ReconcileRequest {
    /// Entity types to reconcile; all types when omitted
    pub entity_types: Option<Vec<String>>,
}

/// Register a new license
#[utoipa::path(
    post,
    path = "/licenses",
    security(("bearer_auth" = [])),
    request_body = CreateLicenseRequest,
    responses(
        (status = 201, description = "License registered", body = LicenseInfo),
        (status = 400, description = "Invalid request body", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 409, description = "License number already registered", body = ApiError)
    ),
    tag = "licenses"
)]
pub async fn create_license(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Json(request): Json<CreateLicenseRequest>,
) -> Result<(StatusCode, Json<LicenseInfo>), ApiError> {
    if request.license_number.trim().is_empty() {
        return Err(validation_error(
            "Invalid license number",
            serde_json::json!({ "license_number": "Must not be empty" }),
        ));
    }
    if request.sync_interval_seconds < 60 {
        return Err(validation_error(
            "Invalid sync interval",
            serde_json::json!({ "sync_interval_seconds": "Must be at least 60" }),
        ));
    }

    let encrypted = encrypt_license_credentials(
        &state.crypto_key,
        request.site_id,
        &request.license_number.to_uppercase(),
        &request.api_key,
        &request.user_key,
    )
    .map_err(|err| ApiError::from(anyhow::anyhow!(err)))?;

    let license = LicenseRepository::new(state.db.clone())
        .create(NewLicense {
            license_number: request.license_number,
            site_id: request.site_id,
            api_key_encrypted: encrypted.api_key,
            user_key_encrypted: encrypted.user_key,
            auto_sync_enabled: request.auto_sync_enabled,
            sync_interval_seconds: request.sync_interval_seconds,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(license.into())))
}

/// List licenses
#[utoipa::path(
    get,
    path = "/licenses",
    security(("bearer_auth" = [])),
    params(
        ("active_only" = Option<bool>, Query, description = "Only return active licenses")
    ),
    responses(
        (status = 200, description = "Registered licenses", body = [LicenseInfo]),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "licenses"
)]
pub async fn list_licenses(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Query(query): Query<ListLicensesQuery>,
) -> Result<Json<Vec<LicenseInfo>>, ApiError> {
    let licenses = LicenseRepository::new(state.db.clone())
        .list(query.active_only)
        .await?;
    Ok(Json(licenses.into_iter().map(Into::into).collect()))
}

/// Get one license
#[utoipa::path(
    get,
    path = "/licenses/{license_id}",
    security(("bearer_auth" = [])),
    params(("license_id" = Uuid, Path, description = "License ID")),
    responses(
        (status = 200, description = "License details", body = LicenseInfo),
        (status = 404, description = "License not found", body = ApiError)
    ),
    tag = "licenses"
)]
pub async fn get_license(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(license_id): Path<Uuid>,
) -> Result<Json<LicenseInfo>, ApiError> {
    let license = LicenseRepository::new(state.db.clone())
        .find_by_id(license_id)
        .await?
        .ok_or_else(|| crate::error::not_found("License not found"))?;
    Ok(Json(license.into()))
}

/// Update a license
#[utoipa::path(
    patch,
    path = "/licenses/{license_id}",
    security(("bearer_auth" = [])),
    params(("license_id" = Uuid, Path, description = "License ID")),
    request_body = UpdateLicenseRequest,
    responses(
        (status = 200, description = "Updated license", body = LicenseInfo),
        (status = 400, description = "Invalid request body", body = ApiError),
        (status = 404, description = "License not found", body = ApiError)
    ),
    tag = "licenses"
)]
pub async fn update_license(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(license_id): Path<Uuid>,
    Json(request): Json<UpdateLicenseRequest>,
) -> Result<Json<LicenseInfo>, ApiError> {
    if let Some(interval) = request.sync_interval_seconds {
        if interval < 60 {
            return Err(validation_error(
                "Invalid sync interval",
                serde_json::json!({ "sync_interval_seconds": "Must be at least 60" }),
            ));
        }
    }

    let repo = LicenseRepository::new(state.db.clone());

    let credentials = match (&request.api_key, &request.user_key) {
        (Some(api_key), Some(user_key)) => {
            let license = repo
                .find_by_id(license_id)
                .await?
                .ok_or_else(|| crate::error::not_found("License not found"))?;
            let encrypted = encrypt_license_credentials(
                &state.crypto_key,
                license.site_id,
                &license.license_number,
                api_key,
                user_key,
            )
            .map_err(|err| ApiError::from(anyhow::anyhow!(err)))?;
            Some((encrypted.api_key, encrypted.user_key))
        }
        (None, None) => None,
        _ => {
            return Err(validation_error(
                "Credentials must be replaced as a pair",
                serde_json::json!({ "api_key": "Send both api_key and user_key" }),
            ));
        }
    };

    let updated = repo
        .update(
            license_id,
            LicenseUpdate {
                active: request.active,
                auto_sync_enabled: request.auto_sync_enabled,
                sync_interval_seconds: request.sync_interval_seconds,
                credentials,
            },
        )
        .await?;
    Ok(Json(updated.into()))
}

/// Aggregated sync status for one license
#[utoipa::path(
    get,
    path = "/licenses/{license_id}/status",
    security(("bearer_auth" = [])),
    params(("license_id" = Uuid, Path, description = "License ID")),
    responses(
        (status = 200, description = "License sync status", body = LicenseStatus),
        (status = 404, description = "License not found", body = ApiError)
    ),
    tag = "licenses"
)]
pub async fn license_status(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(license_id): Path<Uuid>,
) -> Result<Json<LicenseStatus>, ApiError> {
    let license = LicenseRepository::new(state.db.clone())
        .find_by_id(license_id)
        .await?
        .ok_or_else(|| crate::error::not_found("License not found"))?;

    let queue_live = QueueRepository::new(state.db.clone())
        .has_live_items(license_id)
        .await?;
    let dead_letter_count = DeadLetterRepository::new(state.db.clone())
        .count_for_license(license_id)
        .await?;
    let active_job = SyncJobRepository::new(state.db.clone())
        .find_active_for_license(license_id)
        .await?;
    let checkpoints = CheckpointRepository::new(state.db.clone())
        .list_for_license(license_id)
        .await?
        .into_iter()
        .map(|checkpoint| CheckpointInfo {
            entity_type: checkpoint.entity_type,
            direction: checkpoint.direction,
            cursor: checkpoint.cursor,
            last_run_at: checkpoint.last_run_at.map(|dt| dt.to_rfc3339()),
            last_status: checkpoint.last_status,
        })
        .collect();

    Ok(Json(LicenseStatus {
        license: license.into(),
        queue_live,
        dead_letter_count,
        active_job_id: active_job.map(|job| job.id.to_string()),
        checkpoints,
    }))
}

/// Clear stored checkpoints, forcing a full resync
#[utoipa::path(
    post,
    path = "/licenses/{license_id}/checkpoints/reset",
    security(("bearer_auth" = [])),
    params(("license_id" = Uuid, Path, description = "License ID")),
    request_body = ResetCheckpointsRequest,
    responses(
        (status = 200, description = "Checkpoints cleared", body = ResetCheckpointsResponse),
        (status = 400, description = "Invalid filters", body = ApiError),
        (status = 404, description = "License not found", body = ApiError)
    ),
    tag = "licenses"
)]
pub async fn reset_checkpoints(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(license_id): Path<Uuid>,
    Json(request): Json<ResetCheckpointsRequest>,
) -> Result<Json<ResetCheckpointsResponse>, ApiError> {
    LicenseRepository::new(state.db.clone())
        .find_by_id(license_id)
        .await?
        .ok_or_else(|| crate::error::not_found("License not found"))?;

    let entity_type = request
        .entity_type
        .as_deref()
        .map(|value| {
            EntityType::parse(value).ok_or_else(|| {
                validation_error(
                    "Unknown entity type",
                    serde_json::json!({ "entity_type": value }),
                )
            })
        })
        .transpose()?;
    let direction = request
        .direction
        .as_deref()
        .map(|value| {
            Direction::parse(value).ok_or_else(|| {
                validation_error(
                    "Unknown direction",
                    serde_json::json!({ "direction": value }),
                )
            })
        })
        .transpose()?;

    let cleared = CheckpointRepository::new(state.db.clone())
        .reset(license_id, entity_type, direction)
        .await?;
    Ok(Json(ResetCheckpointsResponse { cleared }))
}

/// Run a reconciliation pass for a license
#[utoipa::path(
    post,
    path = "/licenses/{license_id}/reconcile",
    security(("bearer_auth" = [])),
    params(("license_id" = Uuid, Path, description = "License ID")),
    request_body = ReconcileRequest,
    responses(
        (status = 200, description = "Reconciliation summary", body = ReconcileSummary),
        (status = 400, description = "Invalid entity types", body = ApiError),
        (status = 404, description = "License not found", body = ApiError)
    ),
    tag = "licenses"
)]
pub async fn reconcile_license(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(license_id): Path<Uuid>,
    Json(request): Json<ReconcileRequest>,
) -> Result<Json<ReconcileSummary>, ApiError> {
    let license = LicenseRepository::new(state.db.clone())
        .find_by_id(license_id)
        .await?
        .ok_or_else(|| crate::error::not_found("License not found"))?;

    let entity_types = match request.entity_types {
        None => EntityType::ALL.to_vec(),
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
            .collect::<Result<Vec<_>, _>>()?,
    };

    let reconciler = Reconciler::new(
        state.config.clone(),
        std::sync::Arc::new(state.db.clone()),
        state.adapter.clone(),
        state.inventory.clone(),
        state.crypto_key.clone(),
    );
    let summary = reconciler.reconcile(&license, &entity_types).await?;
    Ok(Json(summary))
}
