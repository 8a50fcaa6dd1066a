//! # Server Configuration
//!
//! This module contains the server setup and configuration for the regsync
//! admin API.

use std::sync::Arc;

use axum::{
    Router,
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::config::AppConfig;
use crate::crypto::CryptoKey;
use crate::handlers;
use crate::local::LocalInventory;
use crate::registry::RegistryAdapter;
use crate::telemetry::{TraceContext, with_trace_context};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub adapter: Arc<dyn RegistryAdapter>,
    pub inventory: Arc<dyn LocalInventory>,
    pub audit: Arc<dyn AuditSink>,
    pub crypto_key: Arc<CryptoKey>,
}

/// Assign a trace ID to every request and scope it for error responses.
async fn trace_middleware(request: Request, next: Next) -> Response {
    let context = TraceContext {
        trace_id: Uuid::new_v4().to_string(),
    };
    let mut request = request;
    request.extensions_mut().insert(context.clone());
    with_trace_context(context, next.run(request)).await
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/licenses",
            post(handlers::licenses::create_license).get(handlers::licenses::list_licenses),
        )
        .route(
            "/licenses/{license_id}",
            get(handlers::licenses::get_license).patch(handlers::licenses::update_license),
        )
        .route(
            "/licenses/{license_id}/status",
            get(handlers::licenses::license_status),
        )
        .route(
            "/licenses/{license_id}/checkpoints/reset",
            post(handlers::licenses::reset_checkpoints),
        )
        .route(
            "/licenses/{license_id}/reconcile",
            post(handlers::licenses::reconcile_license),
        )
        .route("/licenses/{license_id}/sync", post(handlers::jobs::start_sync))
        .route("/licenses/{license_id}/jobs", get(handlers::jobs::list_jobs))
        .route(
            "/licenses/{license_id}/queue/items",
            post(handlers::jobs::enqueue_item),
        )
        .route("/jobs/{job_id}", get(handlers::jobs::get_job))
        .route("/jobs/{job_id}/cancel", post(handlers::jobs::cancel_job))
        .route(
            "/jobs/{job_id}/retry-failed",
            post(handlers::jobs::retry_failed),
        )
        .route(
            "/dead-letter",
            get(handlers::dead_letter::list_dead_letter),
        )
        .route(
            "/dead-letter/{item_id}/retry",
            post(handlers::dead_letter::retry_item),
        )
        .route(
            "/dead-letter/{item_id}/dismiss",
            post(handlers::dead_letter::dismiss_item),
        )
        .route(
            "/licenses/{license_id}/dead-letter/retry-all",
            post(handlers::dead_letter::retry_all),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .merge(protected)
        .layer(middleware::from_fn(trace_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Starts the server with the given state, shutting down on cancellation.
pub async fn run_server(
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = state
        .config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, %profile, "Admin API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::licenses::create_license,
        crate::handlers::licenses::list_licenses,
        crate::handlers::licenses::get_license,
        crate::handlers::licenses::update_license,
        crate::handlers::licenses::license_status,
        crate::handlers::licenses::reset_checkpoints,
        crate::handlers::licenses::reconcile_license,
        crate::handlers::jobs::start_sync,
        crate::handlers::jobs::get_job,
        crate::handlers::jobs::list_jobs,
        crate::handlers::jobs::cancel_job,
        crate::handlers::jobs::retry_failed,
        crate::handlers::jobs::enqueue_item,
        crate::handlers::dead_letter::list_dead_letter,
        crate::handlers::dead_letter::retry_item,
        crate::handlers::dead_letter::retry_all,
        crate::handlers::dead_letter::dismiss_item,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::handlers::licenses::CreateLicenseRequest,
            crate::handlers::licenses::UpdateLicenseRequest,
            crate::handlers::licenses::LicenseInfo,
            crate::handlers::licenses::LicenseStatus,
            crate::handlers::licenses::CheckpointInfo,
            crate::handlers::licenses::ResetCheckpointsRequest,
            crate::handlers::licenses::ResetCheckpointsResponse,
            crate::handlers::licenses::ReconcileRequest,
            crate::handlers::jobs::StartSyncRequest,
            crate::handlers::jobs::CancelJobRequest,
            crate::handlers::jobs::JobInfo,
            crate::handlers::jobs::EnqueueItemRequest,
            crate::handlers::jobs::EnqueueItemResponse,
            crate::handlers::jobs::RetryFailedResponse,
            crate::handlers::dead_letter::DeadLetterItemInfo,
            crate::handlers::dead_letter::DismissRequest,
            crate::handlers::dead_letter::RetryAllResponse,
            crate::reconciliation::ReconcileSummary,
            crate::reconciliation::Conflict,
            crate::reconciliation::EntityTypeCounts,
            crate::error::ApiError,
        )
    ),
    info(
        title = "Regsync Admin API",
        description = "Admin API for the compliance registry sync engine",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
