use sea_orm_migration::{prelude::*, schema::*};

use crate::m20250302_000001_add_clients_engagements::Engagements;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Documents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Documents::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Documents::FirmId))
                    .col(string(Documents::ClientId))
                    .col(string(Documents::EngagementId))
                    .col(string(Documents::Title))
                    .col(string(Documents::DocumentType))
                    .col(
                        ColumnDef::new(Documents::Status)
                            .string()
                            .not_null()
                            .default("uploaded"),
                    )
                    .col(string(Documents::CreatedByUserId))
                    .col(big_integer(Documents::CreatedAt))
                    .col(big_integer(Documents::UpdatedAt))
                    .col(big_integer_null(Documents::DeletedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_documents_engagement")
                            .from(Documents::Table, Documents::EngagementId)
                            .to(Engagements::Table, Engagements::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_documents_firm_engagement")
                    .table(Documents::Table)
                    .col(Documents::FirmId)
                    .col(Documents::EngagementId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(DocumentVersions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DocumentVersions::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(DocumentVersions::DocumentId))
                    .col(integer(DocumentVersions::VersionNumber))
                    .col(string(DocumentVersions::StorageKey))
                    .col(string(DocumentVersions::FileName))
                    .col(string(DocumentVersions::MimeType))
                    .col(big_integer(DocumentVersions::FileSizeBytes))
                    .col(big_integer(DocumentVersions::UploadedAt))
                    .col(string(DocumentVersions::UploadedByUserId))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_document_versions_document")
                            .from(DocumentVersions::Table, DocumentVersions::DocumentId)
                            .to(Documents::Table, Documents::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Backstop for concurrent replacements claiming the same number
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_document_versions_unique")
                    .table(DocumentVersions::Table)
                    .col(DocumentVersions::DocumentId)
                    .col(DocumentVersions::VersionNumber)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DocumentVersions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Documents::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Documents {
    Table,
    Id,
    FirmId,
    ClientId,
    EngagementId,
    Title,
    DocumentType,
    Status,
    CreatedByUserId,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}

#[derive(DeriveIden)]
enum DocumentVersions {
    Table,
    Id,
    DocumentId,
    VersionNumber,
    StorageKey,
    FileName,
    MimeType,
    FileSizeBytes,
    UploadedAt,
    UploadedByUserId,
}
