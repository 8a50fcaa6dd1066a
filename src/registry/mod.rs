//! Registry adapter trait definition
//!
//! Defines the interface the sync engine uses to talk to an external
//! regulatory registry. The engine is adapter-agnostic; concrete adapters
//! own HTTP details, payload mapping, and rate-limit header parsing.

use async_trait::async_trait;

use crate::models::{EntityType, Operation};

pub mod http;

/// Adapter error with a classification kind plus optional context.
///
/// The kind drives queue retry decisions; the message and details are stored
/// on the failing item for operators.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AdapterError {
    #[serde(flatten)]
    pub kind: AdapterErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterErrorKind {
    /// Rate limited by the registry, with optional retry-after hint
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Transient/retryable error (5xx, connection reset)
    Transient,
    /// The registry call did not complete within the deadline; the submission
    /// may or may not have been applied remotely
    Timeout,
    /// Credential rejection; affects the whole license, not just this item
    Unauthorized,
    /// Permanent rejection (validation failure, unknown entity)
    Permanent,
}

impl AdapterError {
    pub fn rate_limited(retry_after_secs: Option<u64>) -> Self {
        Self {
            kind: AdapterErrorKind::RateLimited { retry_after_secs },
            message: None,
            details: None,
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            kind: AdapterErrorKind::Transient,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self {
            kind: AdapterErrorKind::Timeout,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self {
            kind: AdapterErrorKind::Unauthorized,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self {
            kind: AdapterErrorKind::Permanent,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether the failing item may be retried with backoff.
    ///
    /// Unauthorized is NOT retryable at the item level: the license halts
    /// until credentials are fixed, and retrying individual items would only
    /// burn the rate budget.
    pub fn retryable(&self) -> bool {
        matches!(
            self.kind,
            AdapterErrorKind::RateLimited { .. }
                | AdapterErrorKind::Transient
                | AdapterErrorKind::Timeout
        )
    }

    /// Stable error-code string stored on queue items and audit rows.
    pub fn code(&self) -> &'static str {
        match self.kind {
            AdapterErrorKind::RateLimited { .. } => "RATE_LIMITED",
            AdapterErrorKind::Transient => "TRANSIENT",
            AdapterErrorKind::Timeout => "TIMEOUT",
            AdapterErrorKind::Unauthorized => "UNAUTHORIZED",
            AdapterErrorKind::Permanent => "PERMANENT",
        }
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            AdapterErrorKind::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited")?;
                if let Some(after) = retry_after_secs {
                    write!(f, " (retry after: {}s)", after)?;
                }
            }
            AdapterErrorKind::Transient => write!(f, "Transient error")?,
            AdapterErrorKind::Timeout => write!(f, "Timeout")?,
            AdapterErrorKind::Unauthorized => write!(f, "Unauthorized")?,
            AdapterErrorKind::Permanent => write!(f, "Permanent error")?,
        }
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for AdapterError {}

/// Cursor for incremental registry reads.
///
/// Wraps an opaque JSON payload returned by adapters. The payload may be a
/// primitive or structured object and must round-trip without alteration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Cursor(pub serde_json::Value);

impl Cursor {
    /// Construct a cursor from any JSON value.
    pub fn from_json(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Convenience helper to build a string cursor.
    pub fn from_string<S: Into<String>>(value: S) -> Self {
        Self(serde_json::Value::String(value.into()))
    }

    /// Borrow the underlying JSON value.
    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    /// Attempt to access the cursor as a string.
    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }
}

impl From<Cursor> for serde_json::Value {
    fn from(cursor: Cursor) -> Self {
        cursor.0
    }
}

impl From<serde_json::Value> for Cursor {
    fn from(value: serde_json::Value) -> Self {
        Cursor::from_json(value)
    }
}

/// Decrypted registry credentials for one license.
#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    pub license_number: String,
    pub api_key: String,
    pub user_key: String,
}

/// A single push submission to the registry.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub entity_type: EntityType,
    pub entity_ref: String,
    pub operation: Operation,
    /// Idempotency key forwarded to the registry so replays deduplicate
    /// server-side as well.
    pub idempotency_key: String,
    pub payload: serde_json::Value,
}

/// Outcome of a push submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The registry accepted the submission.
    Accepted { new_cursor: Option<Cursor> },
    /// The registry rejected the submission with a stated reason.
    Rejected {
        code: String,
        message: String,
        retryable: bool,
    },
    /// The registry recognized the idempotency key and had already applied
    /// this submission (e.g. a retry after an ambiguous timeout).
    AlreadyApplied,
}

/// A single remote record fetched during pull.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub entity_ref: String,
    /// Registry-side revision identifier for change detection.
    pub revision: String,
    pub payload: serde_json::Value,
}

/// One page of a registry snapshot listing.
#[derive(Debug, Clone)]
pub struct SnapshotPage {
    pub records: Vec<FetchedRecord>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

/// Interface to an external regulatory registry.
///
/// All methods take credentials explicitly so one adapter instance can serve
/// every license.
#[async_trait]
pub trait RegistryAdapter: Send + Sync {
    /// Submit a local change to the registry (push direction).
    async fn submit(
        &self,
        credentials: &RegistryCredentials,
        request: &SubmitRequest,
    ) -> Result<SubmitOutcome, AdapterError>;

    /// Fetch the current registry state of a single entity (pull direction).
    async fn fetch_entity(
        &self,
        credentials: &RegistryCredentials,
        entity_type: EntityType,
        entity_ref: &str,
    ) -> Result<FetchedRecord, AdapterError>;

    /// List registry records of one entity type, paged from a cursor.
    /// Used to seed pull jobs and by reconciliation.
    async fn fetch_snapshot(
        &self,
        credentials: &RegistryCredentials,
        entity_type: EntityType,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> Result<SnapshotPage, AdapterError>;
}
