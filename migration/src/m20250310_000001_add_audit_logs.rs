use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Append-only: the application never updates or deletes rows here
        manager
            .create_table(
                Table::create()
                    .table(AuditLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AuditLogs::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(AuditLogs::FirmId))
                    .col(string(AuditLogs::UserId))
                    .col(string(AuditLogs::Action))
                    .col(string(AuditLogs::EntityType))
                    .col(string(AuditLogs::EntityId))
                    .col(text(AuditLogs::Metadata))
                    .col(big_integer(AuditLogs::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_audit_logs_firm_created")
                    .table(AuditLogs::Table)
                    .col(AuditLogs::FirmId)
                    .col(AuditLogs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_audit_logs_firm_user")
                    .table(AuditLogs::Table)
                    .col(AuditLogs::FirmId)
                    .col(AuditLogs::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AuditLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AuditLogs {
    Table,
    Id,
    FirmId,
    UserId,
    Action,
    EntityType,
    EntityId,
    Metadata,
    CreatedAt,
}
