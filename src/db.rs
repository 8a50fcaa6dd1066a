//! SeaORM pool setup shared by the admin API and the orchestrator.

use anyhow::{Context, Result};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::AppConfig;

const CONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(#[from] sea_orm::DbErr),
    #[error("invalid database configuration: {0}")]
    InvalidConfiguration(String),
}

/// Open the connection pool, retrying with exponential backoff so a
/// service restart does not race the database coming up.
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    if cfg.database_url.is_empty() {
        return Err(
            DatabaseError::InvalidConfiguration("database URL cannot be empty".to_string()).into(),
        );
    }

    let mut options = ConnectOptions::new(&cfg.database_url);
    options
        .max_connections(cfg.db_max_connections)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let mut delay = Duration::from_millis(100);
    let mut attempt = 1;
    loop {
        match Database::connect(options.clone()).await {
            Ok(conn) => {
                info!(attempt, "Connected to database");
                return Ok(conn);
            }
            Err(err) if attempt < CONNECT_ATTEMPTS => {
                warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "Database connection failed, retrying");
                sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(DatabaseError::ConnectionFailed(err).into()),
        }
    }
}

/// Round-trip a trivial query; backs the `/healthz` endpoint.
pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());
    db.query_one(stmt)
        .await
        .context("Database health check failed")?;
    Ok(())
}
