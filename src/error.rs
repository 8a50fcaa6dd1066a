//! Admin API error responses.
//!
//! Every failure leaves the API as a problem+json body with a
//! SCREAMING_SNAKE code and a trace ID, so operators can correlate a 4xx/5xx
//! with the structured log line that produced it. Unique-constraint
//! detection lives here too; the queue and the job table lean on it to turn
//! racing inserts into benign conflicts.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::telemetry;

/// Problem+json error body returned by every admin endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status for the response; not part of the body.
    #[serde(skip_serializing)]
    pub status: StatusCode,
    /// Stable error code for programmatic handling.
    pub code: Box<str>,
    /// Human-readable message.
    pub message: Box<str>,
    /// Structured detail, usually per-field validation errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds; also emitted as a Retry-After header.
    pub retry_after: Option<u64>,
    /// Correlation ID echoed from the request's trace context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    // Requests always run inside the trace middleware; the generated
    // fallback covers errors raised outside a request, e.g. from the
    // orchestrator's shared repositories.
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(String::into_boxed_str)
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );
        if let Some(retry_after) = self.retry_after
            && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!(error = ?error, "Internal error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(err) => {
                tracing::error!(error = ?err, "Database connection error");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!(error = ?other, "Database error");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Detect a unique-constraint violation on either supported backend.
///
/// Postgres reports SQLSTATE 23505; SQLite reports extended codes 1555
/// (primary key) and 2067 (unique index). Idempotent enqueue and the
/// one-active-job-per-license guard both route racing inserts through here.
pub fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    let sqlx_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(err)) => err,
        _ => return false,
    };
    let Some(db_error) = sqlx_err.as_database_error() else {
        return false;
    };

    db_error.is_unique_violation()
        || db_error
            .code()
            .is_some_and(|code| matches!(code.as_ref(), "23505" | "1555" | "2067"))
}

pub fn unauthorized(message: Option<&str>) -> ApiError {
    ApiError::new(
        StatusCode::UNAUTHORIZED,
        "UNAUTHORIZED",
        message.unwrap_or("Authentication required"),
    )
}

pub fn not_found(message: &str) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

pub fn conflict(message: &str) -> ApiError {
    ApiError::new(StatusCode::CONFLICT, "CONFLICT", message)
}

pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

/// Map a database error into a 500 with a stable operator-facing context line.
pub fn internal_db_error(context: &'static str, err: sea_orm::DbErr) -> ApiError {
    tracing::error!(error = ?err, context, "Database operation failed");
    ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_SERVER_ERROR",
        context,
    )
    .with_details(json!({ "context": context }))
}
