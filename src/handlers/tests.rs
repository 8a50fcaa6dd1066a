//! # Tests for Handlers
//!
//! This module contains unit tests for API handlers, driven through the
//! full router so middleware and extractors are exercised too.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use migration::{Migrator, MigratorTrait};
use sea_orm::Database;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use crate::audit::DbAuditSink;
use crate::config::AppConfig;
use crate::crypto::CryptoKey;
use crate::local::{InventoryError, LocalInventory, LocalRecord, RemoteRecord};
use crate::models::EntityType;
use crate::registry::{
    AdapterError, Cursor, FetchedRecord, RegistryAdapter, RegistryCredentials, SnapshotPage,
    SubmitOutcome, SubmitRequest,
};
use crate::server::{AppState, create_app};

const TEST_TOKEN: &str = "test-token";

struct StubAdapter;

#[async_trait::async_trait]
impl RegistryAdapter for StubAdapter {
    async fn submit(
        &self,
        _credentials: &RegistryCredentials,
        _request: &SubmitRequest,
    ) -> Result<SubmitOutcome, AdapterError> {
        Ok(SubmitOutcome::Accepted { new_cursor: None })
    }

    async fn fetch_entity(
        &self,
        _credentials: &RegistryCredentials,
        _entity_type: EntityType,
        entity_ref: &str,
    ) -> Result<FetchedRecord, AdapterError> {
        Ok(FetchedRecord {
            entity_ref: entity_ref.to_string(),
            revision: "r1".to_string(),
            payload: json!({}),
        })
    }

    async fn fetch_snapshot(
        &self,
        _credentials: &RegistryCredentials,
        _entity_type: EntityType,
        _cursor: Option<&Cursor>,
        _page_size: usize,
    ) -> Result<SnapshotPage, AdapterError> {
        Ok(SnapshotPage {
            records: Vec::new(),
            next_cursor: None,
            has_more: false,
        })
    }
}

struct StubInventory;

#[async_trait::async_trait]
impl LocalInventory for StubInventory {
    async fn snapshot(
        &self,
        _license_id: Uuid,
        _entity_type: EntityType,
    ) -> Result<Vec<LocalRecord>, InventoryError> {
        Ok(Vec::new())
    }

    async fn apply_remote(
        &self,
        _license_id: Uuid,
        _entity_type: EntityType,
        _record: &RemoteRecord,
    ) -> Result<(), InventoryError> {
        Ok(())
    }
}

async fn test_app() -> Router {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("Failed to connect test database");
    Migrator::up(&db, None)
        .await
        .expect("Failed to run migrations");

    let config = AppConfig {
        profile: "test".to_string(),
        operator_tokens: vec![TEST_TOKEN.to_string()],
        ..Default::default()
    };
    let crypto_key =
        CryptoKey::new(vec![7u8; 32]).expect("Failed to create test crypto key");

    let state = AppState {
        config: Arc::new(config),
        db: db.clone(),
        adapter: Arc::new(StubAdapter),
        inventory: Arc::new(StubInventory),
        audit: Arc::new(DbAuditSink::new(db)),
        crypto_key: Arc::new(crypto_key),
    };

    create_app(state)
}

fn authed_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
        .header(header::CONTENT_TYPE, "application/json");

    match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");
    serde_json::from_slice(&bytes).expect("Response body is not JSON")
}

async fn create_test_license(app: &Router) -> String {
    let response = app
        .clone()
        .oneshot(authed_request(
            "POST",
            "/licenses",
            Some(json!({
                "license_number": "cul-00042",
                "site_id": Uuid::new_v4(),
                "api_key": "api-key",
                "user_key": "user-key",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = response_json(response).await;
    body["id"].as_str().expect("License ID missing").to_string()
}

#[tokio::test]
async fn root_returns_service_info() {
    let app = test_app().await;

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["service"], "regsync");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn healthz_reports_ok() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn protected_routes_require_bearer_token() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/licenses")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/licenses")
                .header(header::AUTHORIZATION, "Bearer wrong-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_license_uppercases_number_and_returns_201() {
    let app = test_app().await;
    let license_id = create_test_license(&app).await;

    let response = app
        .oneshot(authed_request(
            "GET",
            &format!("/licenses/{}", license_id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["license_number"], "CUL-00042");
    assert_eq!(body["active"], true);
    // Credentials must never appear in responses.
    assert!(body.get("api_key").is_none());
    assert!(body.get("api_key_encrypted").is_none());
}

#[tokio::test]
async fn create_license_rejects_duplicate_number() {
    let app = test_app().await;
    create_test_license(&app).await;

    let response = app
        .oneshot(authed_request(
            "POST",
            "/licenses",
            Some(json!({
                "license_number": "CUL-00042",
                "site_id": Uuid::new_v4(),
                "api_key": "api-key",
                "user_key": "user-key",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn create_license_rejects_short_interval() {
    let app = test_app().await;

    let response = app
        .oneshot(authed_request(
            "POST",
            "/licenses",
            Some(json!({
                "license_number": "CUL-00099",
                "site_id": Uuid::new_v4(),
                "api_key": "api-key",
                "user_key": "user-key",
                "sync_interval_seconds": 10,
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn update_license_requires_credential_pair() {
    let app = test_app().await;
    let license_id = create_test_license(&app).await;

    let response = app
        .oneshot(authed_request(
            "PATCH",
            &format!("/licenses/{}", license_id),
            Some(json!({ "api_key": "new-key" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn start_sync_conflicts_while_job_is_running() {
    let app = test_app().await;
    let license_id = create_test_license(&app).await;
    let uri = format!("/licenses/{}/sync", license_id);

    let response = app
        .clone()
        .oneshot(authed_request("POST", &uri, Some(json!({}))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = response_json(response).await;
    assert_eq!(body["status"], "pending");
    assert_eq!(body["direction"], "both");

    let response = app
        .oneshot(authed_request("POST", &uri, Some(json!({}))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn enqueue_item_is_idempotent() {
    let app = test_app().await;
    let license_id = create_test_license(&app).await;
    let uri = format!("/licenses/{}/queue/items", license_id);
    let item = json!({
        "entity_type": "package",
        "entity_ref": "PKG-2024-0001",
        "operation": "update",
        "payload": { "weight_grams": 120 },
    });

    let response = app
        .clone()
        .oneshot(authed_request("POST", &uri, Some(item.clone())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let first = response_json(response).await;
    assert_eq!(first["created"], true);

    let response = app
        .oneshot(authed_request("POST", &uri, Some(item)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let second = response_json(response).await;
    assert_eq!(second["created"], false);
    assert_eq!(second["item_id"], first["item_id"]);
}

#[tokio::test]
async fn enqueue_item_rejects_unknown_entity_type() {
    let app = test_app().await;
    let license_id = create_test_license(&app).await;

    let response = app
        .oneshot(authed_request(
            "POST",
            &format!("/licenses/{}/queue/items", license_id),
            Some(json!({
                "entity_type": "greenhouse",
                "entity_ref": "GH-1",
                "operation": "update",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn license_status_aggregates_queue_state() {
    let app = test_app().await;
    let license_id = create_test_license(&app).await;

    app.clone()
        .oneshot(authed_request(
            "POST",
            &format!("/licenses/{}/queue/items", license_id),
            Some(json!({
                "entity_type": "plant",
                "entity_ref": "PLANT-1",
                "operation": "create",
            })),
        ))
        .await
        .unwrap();

    let response = app
        .oneshot(authed_request(
            "GET",
            &format!("/licenses/{}/status", license_id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["queue_live"], true);
    assert_eq!(body["dead_letter_count"], 0);
    assert!(body["active_job_id"].is_null());
}

#[tokio::test]
async fn unknown_license_returns_404() {
    let app = test_app().await;

    let response = app
        .oneshot(authed_request(
            "GET",
            &format!("/licenses/{}", Uuid::new_v4()),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
