use sea_orm_migration::{prelude::*, schema::*};

use crate::m20250301_000001_initial_schema::{Firms, Users};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Clients::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Clients::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Clients::FirmId))
                    .col(string(Clients::Name))
                    .col(string_null(Clients::ExternalReference))
                    .col(
                        ColumnDef::new(Clients::Status)
                            .string()
                            .not_null()
                            .default("active"),
                    )
                    .col(big_integer(Clients::CreatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_clients_firm")
                            .from(Clients::Table, Clients::FirmId)
                            .to(Firms::Table, Firms::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_clients_firm")
                    .table(Clients::Table)
                    .col(Clients::FirmId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Engagements::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Engagements::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Engagements::FirmId))
                    .col(string(Engagements::ClientId))
                    .col(string(Engagements::Name))
                    .col(string(Engagements::FinancialYear))
                    .col(
                        ColumnDef::new(Engagements::Status)
                            .string()
                            .not_null()
                            .default("open"),
                    )
                    .col(string_null(Engagements::DueDate))
                    .col(big_integer(Engagements::CreatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_engagements_client")
                            .from(Engagements::Table, Engagements::ClientId)
                            .to(Clients::Table, Clients::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_engagements_firm_client")
                    .table(Engagements::Table)
                    .col(Engagements::FirmId)
                    .col(Engagements::ClientId)
                    .to_owned(),
            )
            .await?;

        // Assignment tables: one grant per (resource, user)
        manager
            .create_table(
                Table::create()
                    .table(ClientAssignments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ClientAssignments::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(ClientAssignments::FirmId))
                    .col(string(ClientAssignments::ClientId))
                    .col(string(ClientAssignments::UserId))
                    .col(big_integer(ClientAssignments::CreatedAt))
                    .col(string(ClientAssignments::CreatedByUserId))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_client_assignments_client")
                            .from(ClientAssignments::Table, ClientAssignments::ClientId)
                            .to(Clients::Table, Clients::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_client_assignments_user")
                            .from(ClientAssignments::Table, ClientAssignments::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_client_assignments_unique")
                    .table(ClientAssignments::Table)
                    .col(ClientAssignments::ClientId)
                    .col(ClientAssignments::UserId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(EngagementAssignments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EngagementAssignments::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(EngagementAssignments::FirmId))
                    .col(string(EngagementAssignments::EngagementId))
                    .col(string(EngagementAssignments::UserId))
                    .col(big_integer(EngagementAssignments::CreatedAt))
                    .col(string(EngagementAssignments::CreatedByUserId))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_engagement_assignments_engagement")
                            .from(
                                EngagementAssignments::Table,
                                EngagementAssignments::EngagementId,
                            )
                            .to(Engagements::Table, Engagements::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_engagement_assignments_user")
                            .from(EngagementAssignments::Table, EngagementAssignments::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_engagement_assignments_unique")
                    .table(EngagementAssignments::Table)
                    .col(EngagementAssignments::EngagementId)
                    .col(EngagementAssignments::UserId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_engagement_assignments_user")
                    .table(EngagementAssignments::Table)
                    .col(EngagementAssignments::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EngagementAssignments::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ClientAssignments::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Engagements::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Clients::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
pub(crate) enum Clients {
    Table,
    Id,
    FirmId,
    Name,
    ExternalReference,
    Status,
    CreatedAt,
}

#[derive(DeriveIden)]
pub(crate) enum Engagements {
    Table,
    Id,
    FirmId,
    ClientId,
    Name,
    FinancialYear,
    Status,
    DueDate,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ClientAssignments {
    Table,
    Id,
    FirmId,
    ClientId,
    UserId,
    CreatedAt,
    CreatedByUserId,
}

#[derive(DeriveIden)]
enum EngagementAssignments {
    Table,
    Id,
    FirmId,
    EngagementId,
    UserId,
    CreatedAt,
    CreatedByUserId,
}
