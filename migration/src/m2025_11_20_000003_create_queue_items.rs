//! Migration to create the queue_items table.
//!
//! Queue items are the unit of sync work. The partial unique index on the
//! idempotency key guarantees at most one live item per logical change, no
//! matter how many enqueuers race.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(QueueItems::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(QueueItems::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(QueueItems::JobId).uuid().null())
                    .col(ColumnDef::new(QueueItems::LicenseId).uuid().not_null())
                    .col(ColumnDef::new(QueueItems::EntityType).text().not_null())
                    .col(ColumnDef::new(QueueItems::EntityRef).text().not_null())
                    .col(ColumnDef::new(QueueItems::Operation).text().not_null())
                    .col(ColumnDef::new(QueueItems::Direction).text().not_null())
                    .col(ColumnDef::new(QueueItems::Payload).json_binary().null())
                    .col(
                        ColumnDef::new(QueueItems::IdempotencyKey)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(QueueItems::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(QueueItems::Priority)
                            .small_integer()
                            .not_null()
                            .default(50),
                    )
                    .col(
                        ColumnDef::new(QueueItems::ScheduledAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(QueueItems::DependsOnItemId).uuid().null())
                    .col(
                        ColumnDef::new(QueueItems::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(QueueItems::LastErrorCode).text().null())
                    .col(ColumnDef::new(QueueItems::LastError).json_binary().null())
                    .col(ColumnDef::new(QueueItems::DismissNotes).text().null())
                    .col(
                        ColumnDef::new(QueueItems::FailedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(QueueItems::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(QueueItems::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_queue_items_license_id")
                            .from(QueueItems::Table, QueueItems::LicenseId)
                            .to(Licenses::Table, Licenses::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_queue_items_job_id")
                            .from(QueueItems::Table, QueueItems::JobId)
                            .to(SyncJobs::Table, SyncJobs::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        // Idempotency key must be unique among non-terminal items only;
        // succeeded/failed_permanent/dismissed rows stay behind for audit.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_items_live_idempotency_key \
                 ON queue_items (idempotency_key) \
                 WHERE status IN ('pending', 'processing', 'failed')"
                    .to_string(),
            ))
            .await?;

        // Ready-batch scan: license + status + scheduled_at, priority ordering.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_queue_items_ready \
                 ON queue_items (license_id, status, scheduled_at, priority)"
                    .to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_queue_items_job_status")
                    .table(QueueItems::Table)
                    .col(QueueItems::JobId)
                    .col(QueueItems::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_queue_items_live_idempotency_key")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_queue_items_ready").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_queue_items_job_status").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(QueueItems::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum QueueItems {
    Table,
    Id,
    JobId,
    LicenseId,
    EntityType,
    EntityRef,
    Operation,
    Direction,
    Payload,
    IdempotencyKey,
    Status,
    Priority,
    ScheduledAt,
    DependsOnItemId,
    Attempts,
    LastErrorCode,
    LastError,
    DismissNotes,
    FailedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Licenses {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum SyncJobs {
    Table,
    Id,
}
