//! Migration to create the audit_events table.
//!
//! Append-only record of every terminal queue item transition and every
//! manual dead-letter action. Rows are never updated or deleted.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AuditEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AuditEvents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AuditEvents::LicenseId).uuid().not_null())
                    .col(ColumnDef::new(AuditEvents::ItemId).uuid().not_null())
                    .col(ColumnDef::new(AuditEvents::EntityType).text().not_null())
                    .col(ColumnDef::new(AuditEvents::EntityRef).text().not_null())
                    .col(ColumnDef::new(AuditEvents::Outcome).text().not_null())
                    .col(ColumnDef::new(AuditEvents::Actor).text().null())
                    .col(ColumnDef::new(AuditEvents::Detail).json_binary().null())
                    .col(
                        ColumnDef::new(AuditEvents::CreatedAt)
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
                    .name("idx_audit_events_license_created")
                    .table(AuditEvents::Table)
                    .col(AuditEvents::LicenseId)
                    .col(AuditEvents::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_audit_events_license_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(AuditEvents::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AuditEvents {
    Table,
    Id,
    LicenseId,
    ItemId,
    EntityType,
    EntityRef,
    Outcome,
    Actor,
    Detail,
    CreatedAt,
}
