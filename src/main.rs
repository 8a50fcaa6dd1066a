//! # Regsync Main Entry Point
//!
//! This is the main entry point for the regsync service. It wires the admin
//! API server and the background sync orchestrator to a shared state and
//! shuts both down together on SIGINT.

use std::sync::Arc;

use sea_orm_migration::MigratorTrait;
use tokio_util::sync::CancellationToken;

use regsync::audit::DbAuditSink;
use regsync::config::ConfigLoader;
use regsync::crypto::CryptoKey;
use regsync::local::http::HttpInventory;
use regsync::migration::Migrator;
use regsync::orchestrator::Orchestrator;
use regsync::registry::http::HttpRegistryAdapter;
use regsync::server::{AppState, run_server};
use regsync::{db, telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration from layered env files and variables
    let config_loader = ConfigLoader::new();
    let config = Arc::new(config_loader.load()?);

    telemetry::init_tracing(&config)?;
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::info!(profile = %config.profile, config = %redacted_json, "Loaded configuration");
    }

    let db = db::init_pool(&config).await?;
    Migrator::up(&db, None).await?;

    let key_bytes = config
        .crypto_key
        .clone()
        .ok_or("REGSYNC_CRYPTO_KEY is required")?;
    let crypto_key = Arc::new(CryptoKey::new(key_bytes)?);

    let registry_base_url = config
        .registry_base_url
        .clone()
        .ok_or("REGSYNC_REGISTRY_BASE_URL is required")?;
    let inventory_base_url = config
        .inventory_base_url
        .clone()
        .ok_or("REGSYNC_INVENTORY_BASE_URL is required")?;

    let state = AppState {
        config: config.clone(),
        db: db.clone(),
        adapter: Arc::new(HttpRegistryAdapter::new(registry_base_url)?),
        inventory: Arc::new(HttpInventory::new(inventory_base_url)?),
        audit: Arc::new(DbAuditSink::new(db.clone())),
        crypto_key: crypto_key.clone(),
    };

    let shutdown = CancellationToken::new();

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        Arc::new(db.clone()),
        state.adapter.clone(),
        state.inventory.clone(),
        state.audit.clone(),
        crypto_key,
    ));
    let orchestrator_handle = tokio::spawn(orchestrator.run(shutdown.clone()));

    // Trigger graceful shutdown on Ctrl-C
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            signal_token.cancel();
        }
    });

    let result = run_server(state, shutdown.clone()).await;

    // Stop the orchestrator if the server exited on its own
    shutdown.cancel();
    match orchestrator_handle.await {
        Ok(Err(err)) => tracing::error!(error = ?err, "Orchestrator exited with error"),
        Err(err) => tracing::error!(error = ?err, "Orchestrator task panicked"),
        Ok(Ok(())) => {}
    }

    result
}
