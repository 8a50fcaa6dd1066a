//! # Authentication
//!
//! Operator bearer authentication for the admin API. Tokens are compared in
//! constant time against the configured set. An optional `X-Operator`
//! header carries the operator identity recorded on audited manual actions.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::config::AppConfig;
use crate::error::{ApiError, unauthorized};
use crate::server::AppState;

/// Marker type for authenticated operator requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorAuth;

/// Operator identity from the `X-Operator` header, recorded on audit rows.
#[derive(Debug, Clone)]
pub struct OperatorIdentity(pub Option<String>);

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// Authentication middleware that validates bearer tokens
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = request.headers().clone();

    let token = extract_bearer_token(&headers)?;
    validate_token(&config, token)?;

    let identity = headers
        .get("X-Operator")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());

    let mut request = request;
    request
        .extensions_mut()
        .insert(OperatorIdentity(identity));
    request.extensions_mut().insert(OperatorAuth);

    Ok(next.run(request).await)
}

impl<S> FromRequestParts<S> for OperatorAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<OperatorAuth>()
            .copied()
            .ok_or_else(|| unauthorized(None))
    }
}

impl<S> FromRequestParts<S> for OperatorIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<OperatorIdentity>()
            .cloned()
            .ok_or_else(|| unauthorized(None))
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized(Some("Missing Authorization header")))
        .and_then(|value| {
            value
                .to_str()
                .map_err(|_| unauthorized(Some("Invalid Authorization header")))
        })
        .and_then(|header| {
            header
                .strip_prefix("Bearer ")
                .ok_or_else(|| unauthorized(Some("Authorization header must use Bearer scheme")))
        })
}

fn validate_token(config: &AppConfig, token: &str) -> Result<(), ApiError> {
    let is_valid = config
        .operator_tokens
        .iter()
        .any(|configured| ConstantTimeEq::ct_eq(token.as_bytes(), configured.as_bytes()).into());

    if is_valid {
        Ok(())
    } else {
        Err(unauthorized(Some("Invalid bearer token")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_tokens(tokens: &[&str]) -> AppConfig {
        let mut config = AppConfig::default();
        config.operator_tokens = tokens.iter().map(|t| t.to_string()).collect();
        config
    }

    #[test]
    fn validate_token_accepts_configured_token() {
        let config = config_with_tokens(&["alpha", "beta"]);
        assert!(validate_token(&config, "beta").is_ok());
    }

    #[test]
    fn validate_token_rejects_unknown_token() {
        let config = config_with_tokens(&["alpha"]);
        assert!(validate_token(&config, "gamma").is_err());
    }

    #[test]
    fn extract_bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(extract_bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc");
    }
}
