//! Integration tests for the admin API HTTP surface, driven over a real
//! listener with a scripted registry behind it.

mod test_utils;

use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::Client;
use sea_orm::DatabaseConnection;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use regsync::config::RetryPolicyConfig;
use regsync::models::{Direction, EntityType, Operation, item_status};
use regsync::registry::AdapterError;
use regsync::repositories::QueueRepository;
use regsync::repositories::queue::EnqueueRequest;
use regsync::server::create_app;
use test_utils::{
    MemoryInventory, ScriptedAdapter, TEST_TOKEN, create_test_license, setup_test_db, test_state,
    test_crypto_key,
};

/// Start the API on a random port and return its base URL with the database.
async fn start_test_server() -> (String, DatabaseConnection) {
    let db = setup_test_db().await.expect("Failed to init test DB");
    let state = test_state(
        db.clone(),
        Arc::new(ScriptedAdapter::new()),
        Arc::new(MemoryInventory::new()),
    );
    let app = create_app(state);

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), db)
}

fn authed(client: &Client, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
    client
        .request(method, url)
        .bearer_auth(TEST_TOKEN)
        .header("X-Operator", "ops@example.com")
}

/// Put one permanently failed item on the queue directly.
async fn seed_dead_letter(db: &DatabaseConnection, license_id: uuid::Uuid, entity_ref: &str) {
    let queue = QueueRepository::new(db.clone());
    queue
        .enqueue(EnqueueRequest {
            license_id,
            job_id: None,
            entity_type: EntityType::Package,
            entity_ref: entity_ref.to_string(),
            operation: Operation::Update,
            direction: Direction::Push,
            payload: Some(json!({})),
            priority: 50,
            depends_on_item_id: None,
        })
        .await
        .unwrap();
    let batch = queue.ready_batch(license_id, 1).await.unwrap();
    queue
        .mark_failed(
            batch[0].clone(),
            &AdapterError::permanent("validation failed"),
            &RetryPolicyConfig::default(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_root_endpoint() {
    let (server_url, _db) = start_test_server().await;
    let client = Client::new();

    let response = client
        .get(format!("{}/", server_url))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["service"], "regsync");
}

#[tokio::test]
async fn test_openapi_endpoint() {
    let (server_url, _db) = start_test_server().await;
    let client = Client::new();

    let response = client
        .get(format!("{}/openapi.json", server_url))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert!(body.get("openapi").is_some());
    assert_eq!(body["info"]["title"], "Regsync Admin API");
}

#[tokio::test]
async fn test_errors_are_problem_json_with_trace_id() {
    let (server_url, _db) = start_test_server().await;
    let client = Client::new();

    let response = client
        .get(format!("{}/licenses", server_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "UNAUTHORIZED");
    assert!(body["trace_id"].is_string());
}

#[tokio::test]
async fn test_dead_letter_retry_flow() {
    let (server_url, db) = start_test_server().await;
    let client = Client::new();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-API-1")
        .await
        .unwrap();
    seed_dead_letter(&db, license.id, "PKG-API-1").await;

    // The item shows up in the dead-letter listing.
    let response = authed(
        &client,
        reqwest::Method::GET,
        format!("{}/dead-letter?license_id={}", server_url, license.id),
    )
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 200);
    let items: Vec<Value> = response.json().await.unwrap();
    assert_eq!(items.len(), 1);
    let item_id = items[0]["id"].as_str().unwrap().to_string();

    // Manual retry re-enqueues it.
    let response = authed(
        &client,
        reqwest::Method::POST,
        format!("{}/dead-letter/{}/retry", server_url, item_id),
    )
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 200);

    let queue = QueueRepository::new(db.clone());
    let item = queue
        .find_by_id(item_id.parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.status, item_status::PENDING);

    // Retrying again conflicts; the item is no longer dead-lettered.
    let response = authed(
        &client,
        reqwest::Method::POST,
        format!("{}/dead-letter/{}/retry", server_url, item_id),
    )
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn test_dead_letter_dismiss_requires_notes() {
    let (server_url, db) = start_test_server().await;
    let client = Client::new();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-API-2")
        .await
        .unwrap();
    seed_dead_letter(&db, license.id, "PKG-API-2").await;

    let response = authed(
        &client,
        reqwest::Method::GET,
        format!("{}/dead-letter?license_id={}", server_url, license.id),
    )
    .send()
    .await
    .unwrap();
    let items: Vec<Value> = response.json().await.unwrap();
    let item_id = items[0]["id"].as_str().unwrap().to_string();

    let response = authed(
        &client,
        reqwest::Method::POST,
        format!("{}/dead-letter/{}/dismiss", server_url, item_id),
    )
    .json(&json!({ "notes": "   " }))
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 400);

    let response = authed(
        &client,
        reqwest::Method::POST,
        format!("{}/dead-letter/{}/dismiss", server_url, item_id),
    )
    .json(&json!({ "notes": "Registry rejects legacy tag format" }))
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], item_id.as_str());
}

#[tokio::test]
async fn test_retry_all_for_license() {
    let (server_url, db) = start_test_server().await;
    let client = Client::new();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-API-3")
        .await
        .unwrap();
    seed_dead_letter(&db, license.id, "PKG-API-3").await;
    seed_dead_letter(&db, license.id, "PKG-API-4").await;

    let response = authed(
        &client,
        reqwest::Method::POST,
        format!("{}/licenses/{}/dead-letter/retry-all", server_url, license.id),
    )
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["retried"], 2);
}

#[tokio::test]
async fn test_retry_failed_for_job() {
    let (server_url, db) = start_test_server().await;
    let client = Client::new();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-API-6")
        .await
        .unwrap();

    let response = authed(
        &client,
        reqwest::Method::POST,
        format!("{}/licenses/{}/sync", server_url, license.id),
    )
    .json(&json!({ "direction": "push" }))
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 202);
    let job: Value = response.json().await.unwrap();
    let job_id: uuid::Uuid = job["id"].as_str().unwrap().parse().unwrap();

    // Attach one item to the job and fail it permanently.
    let queue = QueueRepository::new(db.clone());
    queue
        .enqueue(EnqueueRequest {
            license_id: license.id,
            job_id: Some(job_id),
            entity_type: EntityType::Package,
            entity_ref: "PKG-API-6".to_string(),
            operation: Operation::Update,
            direction: Direction::Push,
            payload: Some(json!({})),
            priority: 50,
            depends_on_item_id: None,
        })
        .await
        .unwrap();
    let batch = queue.ready_batch(license.id, 1).await.unwrap();
    let (failed, _) = queue
        .mark_failed(
            batch[0].clone(),
            &AdapterError::permanent("validation failed"),
            &RetryPolicyConfig::default(),
        )
        .await
        .unwrap();

    let response = authed(
        &client,
        reqwest::Method::POST,
        format!("{}/jobs/{}/retry-failed", server_url, job_id),
    )
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["retried"], 1);

    let item = queue.find_by_id(failed.id).await.unwrap().unwrap();
    assert_eq!(item.status, item_status::PENDING);
    assert_eq!(item.attempts, 0);

    // An unknown job is a 404.
    let response = authed(
        &client,
        reqwest::Method::POST,
        format!("{}/jobs/{}/retry-failed", server_url, uuid::Uuid::new_v4()),
    )
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_cancel_job_dead_letters_queued_items() {
    let (server_url, db) = start_test_server().await;
    let client = Client::new();
    let license = create_test_license(&db, &test_crypto_key(), "CUL-API-4")
        .await
        .unwrap();

    // Start a job through the API.
    let response = authed(
        &client,
        reqwest::Method::POST,
        format!("{}/licenses/{}/sync", server_url, license.id),
    )
    .json(&json!({ "direction": "push" }))
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 202);
    let job: Value = response.json().await.unwrap();
    let job_id: uuid::Uuid = job["id"].as_str().unwrap().parse().unwrap();

    // Attach queued work to it directly.
    let queue = QueueRepository::new(db.clone());
    queue
        .enqueue(EnqueueRequest {
            license_id: license.id,
            job_id: Some(job_id),
            entity_type: EntityType::Package,
            entity_ref: "PKG-API-5".to_string(),
            operation: Operation::Update,
            direction: Direction::Push,
            payload: None,
            priority: 50,
            depends_on_item_id: None,
        })
        .await
        .unwrap();

    let response = authed(
        &client,
        reqwest::Method::POST,
        format!("{}/jobs/{}/cancel", server_url, job_id),
    )
    .json(&json!({ "reason": "operator requested" }))
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "cancelled");

    // Cancelling a terminal job conflicts.
    let response = authed(
        &client,
        reqwest::Method::POST,
        format!("{}/jobs/{}/cancel", server_url, job_id),
    )
    .json(&json!({}))
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), 409);
}
