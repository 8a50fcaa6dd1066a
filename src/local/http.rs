//! HTTP local-inventory client
//!
//! [`LocalInventory`] implementation talking to the site's inventory service
//! over its internal JSON API. The inventory service is trusted; errors are
//! either missing records or opaque store failures.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

use super::{InventoryError, LocalInventory, LocalRecord, RemoteRecord};
use crate::models::EntityType;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Inventory client over the inventory service's internal API.
pub struct HttpInventory {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct LocalRecordResponse {
    entity_ref: String,
    revision: i64,
    last_pushed_revision: i64,
    #[serde(default)]
    last_seen_remote_revision: Option<String>,
    payload: serde_json::Value,
}

impl HttpInventory {
    pub fn new(base_url: String) -> Result<Self, InventoryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|err| InventoryError::Store(format!("HTTP client build failed: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl LocalInventory for HttpInventory {
    async fn snapshot(
        &self,
        license_id: Uuid,
        entity_type: EntityType,
    ) -> Result<Vec<LocalRecord>, InventoryError> {
        let url = format!(
            "{}/internal/licenses/{}/{}",
            self.base_url,
            license_id,
            entity_type.as_str()
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| InventoryError::Store(err.to_string()))?;
        if !response.status().is_success() {
            return Err(InventoryError::Store(format!(
                "snapshot returned HTTP {}",
                response.status()
            )));
        }

        let records: Vec<LocalRecordResponse> = response
            .json()
            .await
            .map_err(|err| InventoryError::Store(format!("Malformed response: {err}")))?;

        Ok(records
            .into_iter()
            .map(|record| LocalRecord {
                entity_ref: record.entity_ref,
                revision: record.revision,
                last_pushed_revision: record.last_pushed_revision,
                last_seen_remote_revision: record.last_seen_remote_revision,
                payload: record.payload,
            })
            .collect())
    }

    async fn apply_remote(
        &self,
        license_id: Uuid,
        entity_type: EntityType,
        record: &RemoteRecord,
    ) -> Result<(), InventoryError> {
        let url = format!(
            "{}/internal/licenses/{}/{}/{}",
            self.base_url,
            license_id,
            entity_type.as_str(),
            record.entity_ref
        );
        let response = self
            .client
            .put(&url)
            .json(&serde_json::json!({
                "revision": record.revision,
                "payload": record.payload,
            }))
            .send()
            .await
            .map_err(|err| InventoryError::Store(err.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(InventoryError::NotFound {
                entity_ref: record.entity_ref.clone(),
            }),
            status => Err(InventoryError::Store(format!(
                "apply returned HTTP {status}"
            ))),
        }
    }
}
