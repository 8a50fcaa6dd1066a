//! Migration to create the sync_checkpoints table.
//!
//! One durable cursor per (license, entity type, direction) tuple. The
//! unique index makes upsert-on-conflict the only write path.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncCheckpoints::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncCheckpoints::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncCheckpoints::LicenseId).uuid().not_null())
                    .col(
                        ColumnDef::new(SyncCheckpoints::EntityType)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SyncCheckpoints::Direction).text().not_null())
                    .col(ColumnDef::new(SyncCheckpoints::Cursor).json_binary().null())
                    .col(
                        ColumnDef::new(SyncCheckpoints::LastRunAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncCheckpoints::LastStatus).text().null())
                    .col(
                        ColumnDef::new(SyncCheckpoints::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncCheckpoints::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_checkpoints_license_id")
                            .from(SyncCheckpoints::Table, SyncCheckpoints::LicenseId)
                            .to(Licenses::Table, Licenses::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_checkpoints_tuple")
                    .table(SyncCheckpoints::Table)
                    .col(SyncCheckpoints::LicenseId)
                    .col(SyncCheckpoints::EntityType)
                    .col(SyncCheckpoints::Direction)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_checkpoints_tuple").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SyncCheckpoints::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncCheckpoints {
    Table,
    Id,
    LicenseId,
    EntityType,
    Direction,
    Cursor,
    LastRunAt,
    LastStatus,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Licenses {
    Table,
    Id,
}
