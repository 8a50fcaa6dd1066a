//! HTTP registry adapter
//!
//! [`RegistryAdapter`] implementation over the registry's JSON API.
//! Credentials ride as basic auth (API key / user key); the idempotency
//! key is forwarded as a header so the registry can deduplicate replays
//! after ambiguous timeouts.

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use super::{
    AdapterError, Cursor, FetchedRecord, RegistryAdapter, RegistryCredentials, SnapshotPage,
    SubmitOutcome, SubmitRequest,
};
use crate::models::EntityType;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Registry adapter speaking the registry's JSON API over HTTPS.
pub struct HttpRegistryAdapter {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    status: String,
    #[serde(default)]
    cursor: Option<serde_json::Value>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    retryable: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RecordResponse {
    entity_ref: String,
    revision: String,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    records: Vec<RecordResponse>,
    #[serde(default)]
    next_cursor: Option<serde_json::Value>,
    #[serde(default)]
    has_more: bool,
}

impl HttpRegistryAdapter {
    pub fn new(base_url: String) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|err| AdapterError::permanent(format!("HTTP client build failed: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn authed(
        &self,
        builder: RequestBuilder,
        credentials: &RegistryCredentials,
    ) -> RequestBuilder {
        builder
            .basic_auth(&credentials.api_key, Some(&credentials.user_key))
            .header("X-License-Number", &credentials.license_number)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, AdapterError> {
        let response = builder.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, body))
    }
}

fn classify_transport_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::timeout(err.to_string())
    } else {
        AdapterError::transient(err.to_string())
    }
}

fn classify_status(status: StatusCode, retry_after: Option<u64>, body: String) -> AdapterError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AdapterError::unauthorized(body),
        StatusCode::TOO_MANY_REQUESTS => AdapterError::rate_limited(retry_after),
        StatusCode::REQUEST_TIMEOUT => AdapterError::timeout(body),
        status if status.is_server_error() => {
            AdapterError::transient(format!("HTTP {status}: {body}"))
        }
        status => AdapterError::permanent(format!("HTTP {status}: {body}")),
    }
}

#[async_trait::async_trait]
impl RegistryAdapter for HttpRegistryAdapter {
    async fn submit(
        &self,
        credentials: &RegistryCredentials,
        request: &SubmitRequest,
    ) -> Result<SubmitOutcome, AdapterError> {
        let url = format!("{}/v1/submissions", self.base_url);
        let builder = self
            .authed(self.client.post(&url), credentials)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&serde_json::json!({
                "entity_type": request.entity_type.as_str(),
                "entity_ref": request.entity_ref,
                "operation": request.operation.as_str(),
                "payload": request.payload,
            }));

        let response = self.send(builder).await?;
        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|err| AdapterError::transient(format!("Malformed response: {err}")))?;

        match body.status.as_str() {
            "accepted" => Ok(SubmitOutcome::Accepted {
                new_cursor: body.cursor.map(Cursor::from_json),
            }),
            "already_applied" => Ok(SubmitOutcome::AlreadyApplied),
            "rejected" => Ok(SubmitOutcome::Rejected {
                code: body.code.unwrap_or_else(|| "UNKNOWN".to_string()),
                message: body.message.unwrap_or_default(),
                retryable: body.retryable.unwrap_or(false),
            }),
            other => Err(AdapterError::transient(format!(
                "Unknown submission status '{other}'"
            ))),
        }
    }

    async fn fetch_entity(
        &self,
        credentials: &RegistryCredentials,
        entity_type: EntityType,
        entity_ref: &str,
    ) -> Result<FetchedRecord, AdapterError> {
        let url = format!(
            "{}/v1/{}/{}",
            self.base_url,
            entity_type.as_str(),
            entity_ref
        );
        let response = self.send(self.authed(self.client.get(&url), credentials)).await?;
        let record: RecordResponse = response
            .json()
            .await
            .map_err(|err| AdapterError::transient(format!("Malformed response: {err}")))?;

        Ok(FetchedRecord {
            entity_ref: record.entity_ref,
            revision: record.revision,
            payload: record.payload,
        })
    }

    async fn fetch_snapshot(
        &self,
        credentials: &RegistryCredentials,
        entity_type: EntityType,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> Result<SnapshotPage, AdapterError> {
        let url = format!("{}/v1/{}", self.base_url, entity_type.as_str());
        let mut builder = self
            .authed(self.client.get(&url), credentials)
            .query(&[("page_size", page_size.to_string())]);
        if let Some(cursor) = cursor.and_then(|c| c.as_str()) {
            builder = builder.query(&[("cursor", cursor)]);
        }

        let response = self.send(builder).await?;
        let body: SnapshotResponse = response
            .json()
            .await
            .map_err(|err| AdapterError::transient(format!("Malformed response: {err}")))?;

        Ok(SnapshotPage {
            records: body
                .records
                .into_iter()
                .map(|record| FetchedRecord {
                    entity_ref: record.entity_ref,
                    revision: record.revision,
                    payload: record.payload,
                })
                .collect(),
            next_cursor: body.next_cursor.map(Cursor::from_json),
            has_more: body.has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, String::new()).kind,
            crate::registry::AdapterErrorKind::Unauthorized
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(30), String::new()).kind,
            crate::registry::AdapterErrorKind::RateLimited {
                retry_after_secs: Some(30)
            }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, String::new()).kind,
            crate::registry::AdapterErrorKind::Transient
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, None, String::new()).kind,
            crate::registry::AdapterErrorKind::Permanent
        ));
    }
}
