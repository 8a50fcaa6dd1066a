//! Configuration loading for the regsync service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `REGSYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Application configuration derived from `REGSYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Base URL of the external regulatory registry API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_base_url: Option<String>,
    /// Base URL of the local inventory service API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,
}

/// Drive-loop configuration for the sync orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct OrchestratorConfig {
    /// Seconds between supervisor ticks that discover licenses with work.
    #[serde(default = "default_orchestrator_tick_interval_seconds")]
    pub tick_interval_seconds: u64,

    /// Concurrent in-flight registry calls per license drive loop.
    #[serde(default = "default_orchestrator_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Maximum queue items claimed per drive pass (before the rate budget
    /// shrinks it further).
    #[serde(default = "default_orchestrator_batch_size")]
    pub batch_size: usize,

    /// Timeout applied to every registry adapter call.
    #[serde(default = "default_orchestrator_item_timeout_seconds")]
    pub item_timeout_seconds: u64,

    /// Registry call budget per license per minute window.
    #[serde(default = "default_orchestrator_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    /// Page size requested when seeding pull jobs from registry snapshots.
    #[serde(default = "default_orchestrator_snapshot_page_size")]
    pub snapshot_page_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_orchestrator_tick_interval_seconds(),
            worker_concurrency: default_orchestrator_worker_concurrency(),
            batch_size: default_orchestrator_batch_size(),
            item_timeout_seconds: default_orchestrator_item_timeout_seconds(),
            rate_limit_per_minute: default_orchestrator_rate_limit_per_minute(),
            snapshot_page_size: default_orchestrator_snapshot_page_size(),
        }
    }
}

/// Retry and backoff policy for failing queue items.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RetryPolicyConfig {
    /// Retryable failures tolerated before an item goes to the dead letter.
    ///
    /// An item failing retryably is rescheduled while `attempts <
    /// max_attempts`; the next failure after that is permanent.
    #[serde(default = "default_retry_max_attempts")]
    #[schema(example = 5)]
    pub max_attempts: i32,

    /// Items older than this are not retried again regardless of attempts.
    #[serde(default = "default_retry_max_item_age_hours")]
    #[schema(example = 72)]
    pub max_item_age_hours: i64,

    /// Base backoff in seconds; retries wait `base * 2^attempts`.
    #[serde(default = "default_retry_base_seconds")]
    #[schema(example = 5)]
    pub base_seconds: u64,

    /// Ceiling for the exponential backoff.
    #[serde(default = "default_retry_max_seconds")]
    #[schema(example = 900)]
    pub max_seconds: u64,

    /// Symmetric jitter applied to the backoff, as a fraction (0.2 = ±20%).
    #[serde(default = "default_retry_jitter_factor")]
    #[schema(example = 0.2, minimum = 0.0, maximum = 1.0)]
    pub jitter_factor: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            max_item_age_hours: default_retry_max_item_age_hours(),
            base_seconds: default_retry_base_seconds(),
            max_seconds: default_retry_max_seconds(),
            jitter_factor: default_retry_jitter_factor(),
        }
    }
}

impl RetryPolicyConfig {
    /// Validate retry policy bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_seconds > self.max_seconds {
            return Err(ConfigError::InvalidRetryBounds {
                base: self.base_seconds,
                max: self.max_seconds,
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidRetryJitter {
                value: self.jitter_factor,
            });
        }
        if self.max_attempts < 0 {
            return Err(ConfigError::InvalidRetryMaxAttempts {
                value: self.max_attempts,
            });
        }
        Ok(())
    }
}

impl OrchestratorConfig {
    /// Validate orchestrator configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 || self.worker_concurrency > 64 {
            return Err(ConfigError::InvalidWorkerConcurrency {
                value: self.worker_concurrency,
            });
        }
        if self.rate_limit_per_minute == 0 {
            return Err(ConfigError::InvalidRateLimit {
                value: self.rate_limit_per_minute,
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize {
                value: self.batch_size,
            });
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            registry_base_url: None,
            inventory_base_url: None,
            operator_tokens: Vec::new(),
            crypto_key: None,
            orchestrator: OrchestratorConfig::default(),
            retry_policy: RetryPolicyConfig::default(),
        }
    }
}

impl AppConfig {
    /// Resolve the configured API bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Serialize the configuration with secrets redacted for startup logging.
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut redacted = self.clone();
        redacted.operator_tokens = self
            .operator_tokens
            .iter()
            .map(|_| "***".to_string())
            .collect();
        if redacted.crypto_key.is_some() {
            redacted.crypto_key = Some(Vec::new());
        }
        serde_json::to_string(&redacted)
    }

    /// Validate the loaded configuration.
    ///
    /// Operator tokens and the crypto key are mandatory outside the `test`
    /// profile; the sync engine cannot run without either.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.profile != "test" {
            if self.operator_tokens.is_empty() {
                return Err(ConfigError::MissingOperatorTokens);
            }
            if self.crypto_key.is_none() {
                return Err(ConfigError::MissingCryptoKey);
            }
        }
        self.orchestrator.validate()?;
        self.retry_policy.validate()?;
        Ok(())
    }
}

fn default_profile() -> String {
    "dev".to_string()
}

fn default_api_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_orchestrator_tick_interval_seconds() -> u64 {
    5
}

fn default_orchestrator_worker_concurrency() -> usize {
    6
}

fn default_orchestrator_batch_size() -> usize {
    50
}

fn default_orchestrator_item_timeout_seconds() -> u64 {
    60
}

fn default_orchestrator_rate_limit_per_minute() -> u32 {
    100
}

fn default_orchestrator_snapshot_page_size() -> usize {
    200
}

fn default_retry_max_attempts() -> i32 {
    5
}

fn default_retry_max_item_age_hours() -> i64 {
    72
}

fn default_retry_base_seconds() -> u64 {
    5
}

fn default_retry_max_seconds() -> u64 {
    900 // 15 minutes
}

fn default_retry_jitter_factor() -> f64 {
    0.2 // ±20%
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("no operator tokens configured; set REGSYNC_OPERATOR_TOKEN or REGSYNC_OPERATOR_TOKENS")]
    MissingOperatorTokens,
    #[error("crypto key is missing; set REGSYNC_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("retry base seconds ({base}) cannot be greater than max seconds ({max})")]
    InvalidRetryBounds { base: u64, max: u64 },
    #[error("retry jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidRetryJitter { value: f64 },
    #[error("retry max attempts cannot be negative, got {value}")]
    InvalidRetryMaxAttempts { value: i32 },
    #[error("orchestrator worker concurrency must be between 1 and 64, got {value}")]
    InvalidWorkerConcurrency { value: usize },
    #[error("orchestrator rate limit per minute must be positive, got {value}")]
    InvalidRateLimit { value: u32 },
    #[error("orchestrator batch size must be positive, got {value}")]
    InvalidBatchSize { value: usize },
}

/// Loads configuration using layered `.env` files and `REGSYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration from layered env files, then process environment.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("REGSYNC_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let registry_base_url = layered
            .remove("REGISTRY_BASE_URL")
            .filter(|v| !v.is_empty());
        let inventory_base_url = layered
            .remove("INVENTORY_BASE_URL")
            .filter(|v| !v.is_empty());

        // Operator tokens: single token or comma-separated list.
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            tokens
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else if let Some(token) = layered.remove("OPERATOR_TOKEN") {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            }
        } else {
            Vec::new()
        };

        let crypto_key = match layered.remove("CRYPTO_KEY") {
            Some(encoded) if !encoded.trim().is_empty() => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|err| ConfigError::InvalidCryptoKeyBase64 {
                        error: err.to_string(),
                    })?;
                if decoded.len() != 32 {
                    return Err(ConfigError::InvalidCryptoKeyLength {
                        length: decoded.len(),
                    });
                }
                Some(decoded)
            }
            _ => None,
        };

        let orchestrator = OrchestratorConfig {
            tick_interval_seconds: layered
                .remove("ORCHESTRATOR_TICK_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_orchestrator_tick_interval_seconds),
            worker_concurrency: layered
                .remove("ORCHESTRATOR_WORKER_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_orchestrator_worker_concurrency),
            batch_size: layered
                .remove("ORCHESTRATOR_BATCH_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_orchestrator_batch_size),
            item_timeout_seconds: layered
                .remove("ORCHESTRATOR_ITEM_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_orchestrator_item_timeout_seconds),
            rate_limit_per_minute: layered
                .remove("ORCHESTRATOR_RATE_LIMIT_PER_MINUTE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_orchestrator_rate_limit_per_minute),
            snapshot_page_size: layered
                .remove("ORCHESTRATOR_SNAPSHOT_PAGE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_orchestrator_snapshot_page_size),
        };

        let retry_policy = RetryPolicyConfig {
            max_attempts: layered
                .remove("RETRY_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_retry_max_attempts),
            max_item_age_hours: layered
                .remove("RETRY_MAX_ITEM_AGE_HOURS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_retry_max_item_age_hours),
            base_seconds: layered
                .remove("RETRY_BASE_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_retry_base_seconds),
            max_seconds: layered
                .remove("RETRY_MAX_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_retry_max_seconds),
            jitter_factor: layered
                .remove("RETRY_JITTER_FACTOR")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_retry_jitter_factor),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            registry_base_url,
            inventory_base_url,
            operator_tokens,
            crypto_key,
            orchestrator,
            retry_policy,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("REGSYNC_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix("REGSYNC_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_for_test_profile() {
        let mut config = AppConfig::default();
        config.profile = "test".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn non_test_profile_requires_tokens_and_key() {
        let config = AppConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingOperatorTokens)
        ));

        let mut with_tokens = AppConfig::default();
        with_tokens.operator_tokens = vec!["token".to_string()];
        assert!(matches!(
            with_tokens.validate(),
            Err(ConfigError::MissingCryptoKey)
        ));
    }

    #[test]
    fn retry_policy_rejects_inverted_bounds() {
        let policy = RetryPolicyConfig {
            base_seconds: 1_000,
            max_seconds: 10,
            ..RetryPolicyConfig::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(ConfigError::InvalidRetryBounds { .. })
        ));
    }

    #[test]
    fn retry_policy_rejects_out_of_range_jitter() {
        let policy = RetryPolicyConfig {
            jitter_factor: 1.5,
            ..RetryPolicyConfig::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(ConfigError::InvalidRetryJitter { .. })
        ));
    }

    #[test]
    fn orchestrator_rejects_zero_concurrency() {
        let orchestrator = OrchestratorConfig {
            worker_concurrency: 0,
            ..OrchestratorConfig::default()
        };
        assert!(matches!(
            orchestrator.validate(),
            Err(ConfigError::InvalidWorkerConcurrency { .. })
        ));
    }

    #[test]
    fn redacted_json_hides_secrets() {
        let mut config = AppConfig::default();
        config.operator_tokens = vec!["super-secret".to_string()];
        config.crypto_key = Some(vec![0u8; 32]);

        let redacted = config.redacted_json().expect("serialize");
        assert!(!redacted.contains("super-secret"));
    }
}
