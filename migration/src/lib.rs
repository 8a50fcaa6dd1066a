//! Database migrations for the regsync compliance engine.
//!
//! All schema changes are expressed as SeaORM migrations so the engine can
//! run against Postgres in production and in-memory SQLite in tests.

pub use sea_orm_migration::prelude::*;

mod m2025_11_20_000001_create_licenses;
mod m2025_11_20_000002_create_sync_jobs;
mod m2025_11_20_000003_create_queue_items;
mod m2025_11_20_000004_create_sync_checkpoints;
mod m2025_11_20_000005_create_audit_events;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_20_000001_create_licenses::Migration),
            Box::new(m2025_11_20_000002_create_sync_jobs::Migration),
            Box::new(m2025_11_20_000003_create_queue_items::Migration),
            Box::new(m2025_11_20_000004_create_sync_checkpoints::Migration),
            Box::new(m2025_11_20_000005_create_audit_events::Migration),
        ]
    }
}
