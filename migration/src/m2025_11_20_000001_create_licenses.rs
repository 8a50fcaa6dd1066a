//! Migration to create the licenses table.
//!
//! Each row holds one regulatory registry account: the case-normalized
//! license number, the encrypted credential pair, and the sync cadence.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Licenses::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Licenses::Id).uuid().not_null().primary_key())
                    .col(
                        ColumnDef::new(Licenses::LicenseNumber)
                            .text()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Licenses::SiteId).uuid().not_null())
                    .col(
                        ColumnDef::new(Licenses::ApiKeyEncrypted)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Licenses::UserKeyEncrypted)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Licenses::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Licenses::AutoSyncEnabled)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Licenses::SyncIntervalSeconds)
                            .big_integer()
                            .not_null()
                            .default(900),
                    )
                    .col(
                        ColumnDef::new(Licenses::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Licenses::LastSyncError).json_binary().null())
                    .col(
                        ColumnDef::new(Licenses::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Licenses::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_licenses_site_active")
                    .table(Licenses::Table)
                    .col(Licenses::SiteId)
                    .col(Licenses::Active)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_licenses_site_active").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Licenses::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Licenses {
    Table,
    Id,
    LicenseNumber,
    SiteId,
    ApiKeyEncrypted,
    UserKeyEncrypted,
    Active,
    AutoSyncEnabled,
    SyncIntervalSeconds,
    LastSyncedAt,
    LastSyncError,
    CreatedAt,
    UpdatedAt,
}
