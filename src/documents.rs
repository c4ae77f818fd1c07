//! Document lifecycle: uploads, replacement versions, review status,
//! signed downloads and the filtered listing.
//!
//! Writes that touch both the database and the blob store run the database
//! side in one transaction. If anything fails once the blob put has been
//! attempted, the blob is deleted again on a best-effort basis; a failed
//! cleanup is logged and otherwise ignored. Failures before the put leave
//! the blob store alone.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::NaiveDate;
use sea_orm::sea_query::{Alias, Expr, Func, LikeExpr, Query, SimpleExpr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DatabaseTransaction, DbErr,
    EntityTrait, Order, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{
    self, AuditMetadata, BulkUpdateMeta, DownloadMeta, RequestContext, StatusChangeMeta,
    UploadMeta,
};
use crate::blob::BlobStore;
use crate::clients::assigned_engagements;
use crate::entities::{document, document_version};
use crate::errors::DocError;
use crate::page::{self, Page};
use crate::policy::{self, AuthUser, Role};
use crate::settings::Uploads;
use crate::storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    InReview,
    Final,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 3] = [
        DocumentStatus::Uploaded,
        DocumentStatus::InReview,
        DocumentStatus::Final,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::InReview => "in_review",
            DocumentStatus::Final => "final",
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(DocumentStatus::Uploaded),
            "in_review" => Ok(DocumentStatus::InReview),
            "final" => Ok(DocumentStatus::Final),
            other => Err(DocError::BadRequest(format!(
                "unknown document status `{other}`"
            ))),
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review state machine: `uploaded -> in_review -> final`. Staying put is
/// always allowed, and only admins and managers may reopen a final document.
pub fn validate_transition(
    from: DocumentStatus,
    to: DocumentStatus,
    role: Role,
) -> Result<(), DocError> {
    use DocumentStatus::*;

    let allowed = from == to
        || matches!((from, to), (Uploaded, InReview) | (InReview, Final))
        || (from == Final && to == InReview && role.is_privileged());

    if allowed {
        Ok(())
    } else {
        Err(DocError::InvalidStatusTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Reduces a client-supplied file name to a safe final path segment.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    let cleaned: String = cleaned.chars().take(200).collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

pub fn storage_key(
    firm_id: &str,
    client_id: &str,
    engagement_id: &str,
    document_id: &str,
    version_number: i32,
    file_name: &str,
) -> String {
    format!(
        "firms/{firm_id}/clients/{client_id}/engagements/{engagement_id}/documents/{document_id}/v{version_number}/{}",
        sanitize_file_name(file_name)
    )
}

/// MIME type without parameters, lowercased.
fn essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn version_insert_error(err: DbErr, document_id: &str, version_number: i32) -> DocError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => DocError::VersionConflict {
            document_id: document_id.to_string(),
            version_number,
        },
        _ => DocError::Db(err),
    }
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub client_id: String,
    pub engagement_id: String,
    pub title: Option<String>,
    pub document_type: String,
    pub file: UploadedFile,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentWithVersion {
    pub document: document::Model,
    pub version: document_version::Model,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentDetail {
    pub document: document::Model,
    pub versions: Vec<document_version::Model>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkStatusResult {
    pub batch_id: String,
    pub document_ids: Vec<String>,
    pub status: DocumentStatus,
    pub updated: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignedDownload {
    pub url: String,
    pub expires_in_secs: i64,
    pub file_name: String,
    pub mime_type: String,
    pub version_number: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentSortBy {
    Title,
    Status,
    DocumentType,
    CreatedAt,
    #[default]
    UpdatedAt,
    UploadedAt,
    FileName,
    FileSize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentQuery {
    pub client_id: Option<String>,
    pub engagement_id: Option<String>,
    pub q: Option<String>,
    pub status: Option<DocumentStatus>,
    pub document_type: Option<String>,
    pub uploaded_date_start: Option<NaiveDate>,
    pub uploaded_date_end: Option<NaiveDate>,
    pub uploaded_by_user_id: Option<String>,
    pub file_type: Option<String>,
    #[serde(default)]
    pub sort_by: DocumentSortBy,
    #[serde(default)]
    pub sort_direction: SortDirection,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentListItem {
    #[serde(flatten)]
    pub document: document::Model,
    pub latest_version: Option<document_version::Model>,
}

/// Escapes LIKE wildcards and wraps the needle for a substring match.
fn like_pattern(needle: &str) -> LikeExpr {
    let escaped = needle
        .to_lowercase()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    LikeExpr::new(format!("%{escaped}%")).escape('\\')
}

fn lower_like(column: SimpleExpr, needle: &str) -> SimpleExpr {
    Expr::expr(Func::lower(column)).like(like_pattern(needle))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

async fn stage_initial_version(
    txn: &DatabaseTransaction,
    actor: &AuthUser,
    input: &NewDocument,
    document_id: &str,
    key: &str,
) -> Result<DocumentWithVersion, DocError> {
    let now = storage::now();
    let title = input
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(&input.file.file_name)
        .to_string();

    let document = document::ActiveModel {
        id: Set(document_id.to_string()),
        firm_id: Set(actor.firm_id.clone()),
        client_id: Set(input.client_id.clone()),
        engagement_id: Set(input.engagement_id.clone()),
        title: Set(title),
        document_type: Set(input.document_type.trim().to_string()),
        status: Set(DocumentStatus::Uploaded.as_str().to_string()),
        created_by_user_id: Set(actor.id.clone()),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
    }
    .insert(txn)
    .await?;

    let version = insert_version(txn, actor, document_id, 1, &input.file, key, now).await?;
    Ok(DocumentWithVersion { document, version })
}

/// Read-max-then-insert; the unique index on (document_id, version_number)
/// catches concurrent writers.
async fn next_version_number(txn: &DatabaseTransaction, document_id: &str) -> Result<i32, DocError> {
    let current: Option<Option<i32>> = document_version::Entity::find()
        .select_only()
        .column_as(document_version::Column::VersionNumber.max(), "max_version")
        .filter(document_version::Column::DocumentId.eq(document_id))
        .into_tuple()
        .one(txn)
        .await?;
    Ok(current.flatten().unwrap_or(0) + 1)
}

async fn stage_replacement_version(
    txn: &DatabaseTransaction,
    actor: &AuthUser,
    document_id: &str,
    version_number: i32,
    file: &UploadedFile,
) -> Result<DocumentWithVersion, DocError> {
    let document = policy::find_document(txn, &actor.firm_id, document_id)
        .await?
        .ok_or(DocError::NotFound)?;
    let key = storage_key(
        &actor.firm_id,
        &document.client_id,
        &document.engagement_id,
        document_id,
        version_number,
        &file.file_name,
    );
    let now = storage::now();

    let version = insert_version(txn, actor, document_id, version_number, file, &key, now).await?;

    let mut active: document::ActiveModel = document.into();
    active.updated_at = Set(now);
    let document = active.update(txn).await?;

    Ok(DocumentWithVersion { document, version })
}

async fn insert_version(
    txn: &DatabaseTransaction,
    actor: &AuthUser,
    document_id: &str,
    version_number: i32,
    file: &UploadedFile,
    key: &str,
    now: i64,
) -> Result<document_version::Model, DocError> {
    document_version::ActiveModel {
        id: Set(storage::new_id()),
        document_id: Set(document_id.to_string()),
        version_number: Set(version_number),
        storage_key: Set(key.to_string()),
        file_name: Set(file.file_name.clone()),
        mime_type: Set(essence(&file.mime_type)),
        file_size_bytes: Set(file.bytes.len() as i64),
        uploaded_at: Set(now),
        uploaded_by_user_id: Set(actor.id.clone()),
    }
    .insert(txn)
    .await
    .map_err(|e| version_insert_error(e, document_id, version_number))
}

/// Service handle. Cheap to clone; holds the pool and blob store by handle.
#[derive(Clone)]
pub struct DocumentService {
    db: DatabaseConnection,
    blobs: Arc<dyn BlobStore>,
    uploads: Uploads,
    signed_url_ttl_secs: i64,
}

impl DocumentService {
    pub fn new(
        db: DatabaseConnection,
        blobs: Arc<dyn BlobStore>,
        uploads: Uploads,
        signed_url_ttl_secs: i64,
    ) -> Self {
        Self {
            db,
            blobs,
            uploads,
            signed_url_ttl_secs,
        }
    }

    fn validate_upload(&self, file: &UploadedFile) -> Result<(), DocError> {
        let size = file.bytes.len() as u64;
        if size > self.uploads.max_upload_bytes {
            return Err(DocError::FileTooLarge {
                size,
                max: self.uploads.max_upload_bytes,
            });
        }
        let mime = essence(&file.mime_type);
        if !self
            .uploads
            .allowed_mime_types
            .iter()
            .any(|allowed| essence(allowed) == mime)
        {
            return Err(DocError::UnsupportedMimeType(file.mime_type.clone()));
        }
        Ok(())
    }

    /// Best-effort removal of a blob whose database rows never committed.
    async fn compensate(&self, key: &str) {
        if let Err(e) = self.blobs.delete_object(key).await {
            tracing::warn!(key, error = %e, "compensating blob delete failed");
        }
    }

    async fn abort(txn: DatabaseTransaction) {
        if let Err(rollback) = txn.rollback().await {
            tracing::warn!(error = %rollback, "rollback failed");
        }
    }

    /// Second half of every versioned write, run once the rows are staged in
    /// `txn`: store the blob, audit, commit. Only this step compensates, so a
    /// version insert that lost the unique race never deletes the key.
    async fn store_and_commit(
        &self,
        txn: DatabaseTransaction,
        actor: &AuthUser,
        staged: DocumentWithVersion,
        bytes: &[u8],
        ctx: Option<&RequestContext>,
    ) -> Result<DocumentWithVersion, DocError> {
        let key = staged.version.storage_key.clone();
        let outcome = self.store_and_audit(&txn, actor, &staged, bytes, ctx).await;
        let committed = match outcome {
            Ok(()) => txn.commit().await.map_err(DocError::from),
            Err(e) => {
                Self::abort(txn).await;
                Err(e)
            }
        };
        match committed {
            Ok(()) => Ok(staged),
            Err(e) => {
                self.compensate(&key).await;
                Err(e)
            }
        }
    }

    async fn store_and_audit(
        &self,
        txn: &DatabaseTransaction,
        actor: &AuthUser,
        staged: &DocumentWithVersion,
        bytes: &[u8],
        ctx: Option<&RequestContext>,
    ) -> Result<(), DocError> {
        let DocumentWithVersion { document, version } = staged;
        self.blobs
            .put_object(
                &version.storage_key,
                bytes,
                &version.mime_type,
                bytes.len() as u64,
            )
            .await
            .map_err(|e| match e {
                DocError::UploadStorageFailed(_) => e,
                other => DocError::UploadStorageFailed(other.to_string()),
            })?;

        audit::log_audit_event(
            txn,
            &actor.firm_id,
            &actor.id,
            "document",
            &document.id,
            &AuditMetadata::Upload(UploadMeta {
                client_id: document.client_id.clone(),
                engagement_id: document.engagement_id.clone(),
                document_id: document.id.clone(),
                version_number: version.version_number,
                file_name: version.file_name.clone(),
                mime_type: version.mime_type.clone(),
                file_size_bytes: version.file_size_bytes,
                storage_key: version.storage_key.clone(),
            }),
            ctx,
        )
        .await?;
        Ok(())
    }

    pub async fn create_document_with_initial_version(
        &self,
        actor: &AuthUser,
        input: NewDocument,
        ctx: Option<&RequestContext>,
    ) -> Result<DocumentWithVersion, DocError> {
        policy::ensure(
            policy::can_create_document_version(
                &self.db,
                actor,
                &input.client_id,
                &input.engagement_id,
            )
            .await?,
        )?;
        self.validate_upload(&input.file)?;

        let document_id = storage::new_id();
        let key = storage_key(
            &actor.firm_id,
            &input.client_id,
            &input.engagement_id,
            &document_id,
            1,
            &input.file.file_name,
        );

        let txn = self.db.begin().await?;
        let staged = match stage_initial_version(&txn, actor, &input, &document_id, &key).await {
            Ok(staged) => staged,
            Err(e) => {
                Self::abort(txn).await;
                return Err(e);
            }
        };
        let created = self
            .store_and_commit(txn, actor, staged, &input.file.bytes, ctx)
            .await?;

        tracing::info!(
            firm_id = %actor.firm_id,
            document_id = %created.document.id,
            engagement_id = %created.document.engagement_id,
            size = created.version.file_size_bytes,
            "document uploaded"
        );
        Ok(created)
    }

    pub async fn create_document_replacement_version(
        &self,
        actor: &AuthUser,
        document_id: &str,
        file: UploadedFile,
        ctx: Option<&RequestContext>,
    ) -> Result<DocumentWithVersion, DocError> {
        policy::ensure(policy::can_write_document(&self.db, actor, document_id).await?)?;
        self.validate_upload(&file)?;

        let txn = self.db.begin().await?;
        let version_number = match next_version_number(&txn, document_id).await {
            Ok(n) => n,
            Err(e) => {
                Self::abort(txn).await;
                return Err(e);
            }
        };
        let created = self
            .write_version(txn, actor, document_id, version_number, &file, ctx)
            .await?;

        tracing::info!(
            firm_id = %actor.firm_id,
            document_id,
            version_number,
            "document version uploaded"
        );
        Ok(created)
    }

    /// Writes `version_number` of an existing document inside `txn`.
    async fn write_version(
        &self,
        txn: DatabaseTransaction,
        actor: &AuthUser,
        document_id: &str,
        version_number: i32,
        file: &UploadedFile,
        ctx: Option<&RequestContext>,
    ) -> Result<DocumentWithVersion, DocError> {
        let staged =
            match stage_replacement_version(&txn, actor, document_id, version_number, file).await {
                Ok(staged) => staged,
                Err(e) => {
                    Self::abort(txn).await;
                    return Err(e);
                }
            };
        self.store_and_commit(txn, actor, staged, &file.bytes, ctx)
            .await
    }

    /// A same-state update writes no row change but is still audited.
    pub async fn update_document_status(
        &self,
        actor: &AuthUser,
        document_id: &str,
        status: DocumentStatus,
        ctx: Option<&RequestContext>,
    ) -> Result<document::Model, DocError> {
        policy::ensure(policy::can_write_document(&self.db, actor, document_id).await?)?;

        let txn = self.db.begin().await?;
        let document = policy::find_document(&txn, &actor.firm_id, document_id)
            .await?
            .ok_or(DocError::NotFound)?;
        let from: DocumentStatus = document.status.parse()?;
        validate_transition(from, status, actor.role)?;

        let metadata = AuditMetadata::StatusChange(StatusChangeMeta {
            client_id: document.client_id.clone(),
            engagement_id: document.engagement_id.clone(),
            from: from.to_string(),
            to: status.to_string(),
        });

        let document = if from == status {
            document
        } else {
            let mut active: document::ActiveModel = document.into();
            active.status = Set(status.as_str().to_string());
            active.updated_at = Set(storage::now());
            active.update(&txn).await?
        };

        audit::log_audit_event(
            &txn,
            &actor.firm_id,
            &actor.id,
            "document",
            document_id,
            &metadata,
            ctx,
        )
        .await?;
        txn.commit().await?;

        tracing::info!(firm_id = %actor.firm_id, document_id, %from, to = %status, "document status changed");
        Ok(document)
    }

    /// All-or-nothing: every id must resolve and every transition must be
    /// legal before the single UPDATE runs. Loading, checks and the UPDATE
    /// share one transaction.
    pub async fn bulk_update_document_status(
        &self,
        actor: &AuthUser,
        document_ids: &[String],
        status: DocumentStatus,
        ctx: Option<&RequestContext>,
    ) -> Result<BulkStatusResult, DocError> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = document_ids
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();
        if ids.is_empty() {
            return Err(DocError::NoDocuments);
        }

        let txn = self.db.begin().await?;
        let documents = document::Entity::find()
            .filter(document::Column::FirmId.eq(actor.firm_id.as_str()))
            .filter(document::Column::DeletedAt.is_null())
            .filter(document::Column::Id.is_in(ids.clone()))
            .all(&txn)
            .await?;
        if documents.len() != ids.len() {
            return Err(DocError::NotFound);
        }

        for doc in &documents {
            policy::ensure(policy::can_write_document(&txn, actor, &doc.id).await?)?;
        }
        // Each row is only updated from the state it was validated in
        let mut validated = Condition::any();
        for doc in &documents {
            let from: DocumentStatus = doc.status.parse()?;
            validate_transition(from, status, actor.role)?;
            validated = validated.add(
                Condition::all()
                    .add(document::Column::Id.eq(doc.id.as_str()))
                    .add(document::Column::Status.eq(from.as_str())),
            );
        }

        let batch_id = storage::new_id();
        let updated = document::Entity::update_many()
            .col_expr(document::Column::Status, Expr::value(status.as_str()))
            .col_expr(document::Column::UpdatedAt, Expr::value(storage::now()))
            .filter(document::Column::FirmId.eq(actor.firm_id.as_str()))
            .filter(document::Column::DeletedAt.is_null())
            .filter(validated)
            .exec(&txn)
            .await?;
        if updated.rows_affected != ids.len() as u64 {
            tracing::warn!(
                firm_id = %actor.firm_id,
                expected = ids.len(),
                updated = updated.rows_affected,
                "bulk status update raced a concurrent change"
            );
            return Err(DocError::NotFound);
        }

        audit::log_audit_event(
            &txn,
            &actor.firm_id,
            &actor.id,
            "document",
            &batch_id,
            &AuditMetadata::BulkUpdate(BulkUpdateMeta {
                document_ids: ids.clone(),
                status: status.to_string(),
                count: ids.len(),
            }),
            ctx,
        )
        .await?;
        txn.commit().await?;

        tracing::info!(firm_id = %actor.firm_id, %batch_id, count = ids.len(), to = %status, "bulk status update");
        Ok(BulkStatusResult {
            batch_id,
            updated: ids.len(),
            document_ids: ids,
            status,
        })
    }

    /// Signs a short-lived link to one version. The link is audited before
    /// it is returned.
    pub async fn create_signed_download_for_version(
        &self,
        actor: &AuthUser,
        document_id: &str,
        version_number: i32,
        ctx: Option<&RequestContext>,
    ) -> Result<SignedDownload, DocError> {
        policy::ensure(
            policy::can_read_document_version(&self.db, actor, document_id, version_number).await?,
        )?;
        let document = policy::find_document(&self.db, &actor.firm_id, document_id)
            .await?
            .ok_or(DocError::NotFound)?;
        policy::ensure(policy::can_read_engagement(&self.db, actor, &document.engagement_id).await?)?;

        let version = document_version::Entity::find()
            .filter(document_version::Column::DocumentId.eq(document_id))
            .filter(document_version::Column::VersionNumber.eq(version_number))
            .one(&self.db)
            .await?
            .ok_or(DocError::NotFound)?;

        let url = self
            .blobs
            .signed_download_url(&version.storage_key, self.signed_url_ttl_secs)
            .await
            .map_err(|e| match e {
                DocError::DownloadUrlGenerationFailed(_) => e,
                other => DocError::DownloadUrlGenerationFailed(other.to_string()),
            })?;

        audit::log_audit_event(
            &self.db,
            &actor.firm_id,
            &actor.id,
            "document",
            document_id,
            &AuditMetadata::Download(DownloadMeta {
                client_id: document.client_id.clone(),
                engagement_id: document.engagement_id.clone(),
                document_id: document_id.to_string(),
                version_number,
                file_name: version.file_name.clone(),
                storage_key: version.storage_key.clone(),
                expires_in_secs: self.signed_url_ttl_secs,
            }),
            ctx,
        )
        .await?;

        Ok(SignedDownload {
            url,
            expires_in_secs: self.signed_url_ttl_secs,
            file_name: version.file_name,
            mime_type: version.mime_type,
            version_number,
        })
    }

    pub async fn get_document(
        &self,
        actor: &AuthUser,
        document_id: &str,
    ) -> Result<DocumentDetail, DocError> {
        policy::ensure(policy::can_read_document(&self.db, actor, document_id).await?)?;
        let document = policy::find_document(&self.db, &actor.firm_id, document_id)
            .await?
            .ok_or(DocError::NotFound)?;
        let versions = document_version::Entity::find()
            .filter(document_version::Column::DocumentId.eq(document_id))
            .order_by_asc(document_version::Column::VersionNumber)
            .all(&self.db)
            .await?;

        Ok(DocumentDetail { document, versions })
    }

    /// Soft delete. Versions and blobs stay in place.
    pub async fn delete_document(
        &self,
        actor: &AuthUser,
        document_id: &str,
        ctx: Option<&RequestContext>,
    ) -> Result<(), DocError> {
        policy::ensure(policy::can_write_document(&self.db, actor, document_id).await?)?;

        let txn = self.db.begin().await?;
        let document = policy::find_document(&txn, &actor.firm_id, document_id)
            .await?
            .ok_or(DocError::NotFound)?;
        let metadata = AuditMetadata::other(
            "document.delete",
            json!({
                "clientId": document.client_id,
                "engagementId": document.engagement_id,
                "documentId": document.id,
                "title": document.title,
            }),
        );

        let now = storage::now();
        let mut active: document::ActiveModel = document.into();
        active.deleted_at = Set(Some(now));
        active.updated_at = Set(now);
        active.update(&txn).await?;

        audit::log_audit_event(
            &txn,
            &actor.firm_id,
            &actor.id,
            "document",
            document_id,
            &metadata,
            ctx,
        )
        .await?;
        txn.commit().await?;

        tracing::info!(firm_id = %actor.firm_id, document_id, "document deleted");
        Ok(())
    }

    /// Filtered, sorted page of documents, each joined to its latest version.
    /// Staff only see documents under engagements they are assigned to.
    pub async fn list_documents(
        &self,
        actor: &AuthUser,
        query: &DocumentQuery,
    ) -> Result<Page<DocumentListItem>, DocError> {
        let limit = page::clamp_limit(query.limit);
        let offset = query.offset.unwrap_or(0);

        let latest = Alias::new("latest");
        let latest_version = Query::select()
            .expr(Expr::col((latest.clone(), document_version::Column::VersionNumber)).max())
            .from_as(document_version::Entity, latest.clone())
            .and_where(
                Expr::col((latest.clone(), document_version::Column::DocumentId))
                    .equals((document::Entity, document::Column::Id)),
            )
            .to_owned();

        let mut select = document::Entity::find()
            .find_also_related(document_version::Entity)
            .filter(document::Column::FirmId.eq(actor.firm_id.as_str()))
            .filter(document::Column::DeletedAt.is_null())
            .filter(document_version::Column::VersionNumber.in_subquery(latest_version));

        if !actor.is_privileged() {
            select = select.filter(document::Column::EngagementId.in_subquery(assigned_engagements(actor)));
        }
        if let Some(client_id) = non_empty(&query.client_id) {
            select = select.filter(document::Column::ClientId.eq(client_id));
        }
        if let Some(engagement_id) = non_empty(&query.engagement_id) {
            select = select.filter(document::Column::EngagementId.eq(engagement_id));
        }
        if let Some(status) = query.status {
            select = select.filter(document::Column::Status.eq(status.as_str()));
        }
        if let Some(document_type) = non_empty(&query.document_type) {
            select = select.filter(document::Column::DocumentType.eq(document_type));
        }
        if let Some(start) = query.uploaded_date_start {
            select = select
                .filter(document_version::Column::UploadedAt.gte(page::start_of_day(start)));
        }
        if let Some(end) = query.uploaded_date_end {
            select = select
                .filter(document_version::Column::UploadedAt.lt(page::end_of_day_exclusive(end)));
        }
        if let Some(uploader) = non_empty(&query.uploaded_by_user_id) {
            select = select.filter(document_version::Column::UploadedByUserId.eq(uploader));
        }
        if let Some(file_type) = non_empty(&query.file_type) {
            select = select.filter(lower_like(
                Expr::col((document_version::Entity, document_version::Column::MimeType)).into(),
                file_type,
            ));
        }
        if let Some(q) = non_empty(&query.q) {
            select = select.filter(
                Condition::any()
                    .add(lower_like(
                        Expr::col((document::Entity, document::Column::Title)).into(),
                        q,
                    ))
                    .add(lower_like(
                        Expr::col((document_version::Entity, document_version::Column::FileName))
                            .into(),
                        q,
                    )),
            );
        }

        let total = select.clone().count(&self.db).await?;

        let order = match query.sort_direction {
            SortDirection::Asc => Order::Asc,
            SortDirection::Desc => Order::Desc,
        };
        select = match query.sort_by {
            DocumentSortBy::Title => select.order_by(document::Column::Title, order.clone()),
            DocumentSortBy::Status => select.order_by(document::Column::Status, order.clone()),
            DocumentSortBy::DocumentType => {
                select.order_by(document::Column::DocumentType, order.clone())
            }
            DocumentSortBy::CreatedAt => select.order_by(document::Column::CreatedAt, order.clone()),
            DocumentSortBy::UpdatedAt => select.order_by(document::Column::UpdatedAt, order.clone()),
            DocumentSortBy::UploadedAt => {
                select.order_by(document_version::Column::UploadedAt, order.clone())
            }
            DocumentSortBy::FileName => {
                select.order_by(document_version::Column::FileName, order.clone())
            }
            DocumentSortBy::FileSize => {
                select.order_by(document_version::Column::FileSizeBytes, order.clone())
            }
        };

        let rows = select
            .order_by(document::Column::Id, order)
            .limit(limit)
            .offset(offset)
            .all(&self.db)
            .await?;

        let items = rows
            .into_iter()
            .map(|(document, latest_version)| DocumentListItem {
                document,
                latest_version,
            })
            .collect();

        Ok(Page {
            items,
            total,
            limit,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DocumentStatus::*;

    #[test]
    fn test_transition_table() {
        // (from, to, staff allowed, privileged allowed)
        let table = [
            (Uploaded, Uploaded, true, true),
            (Uploaded, InReview, true, true),
            (Uploaded, Final, false, false),
            (InReview, Uploaded, false, false),
            (InReview, InReview, true, true),
            (InReview, Final, true, true),
            (Final, Uploaded, false, false),
            (Final, InReview, false, true),
            (Final, Final, true, true),
        ];
        for (from, to, staff, privileged) in table {
            assert_eq!(
                validate_transition(from, to, Role::Staff).is_ok(),
                staff,
                "staff {from} -> {to}"
            );
            for role in [Role::Admin, Role::Manager] {
                assert_eq!(
                    validate_transition(from, to, role).is_ok(),
                    privileged,
                    "{role} {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_invalid_transition_error_names_states() {
        match validate_transition(Final, Uploaded, Role::Admin) {
            Err(DocError::InvalidStatusTransition { from, to }) => {
                assert_eq!(from, "final");
                assert_eq!(to, "uploaded");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("return.pdf"), "return.pdf");
        assert_eq!(sanitize_file_name("Tax Return 2024.pdf"), "Tax_Return_2024.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\docs\\a.txt"), "a.txt");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name("..."), "file");
        assert_eq!(sanitize_file_name(&"a".repeat(500)).len(), 200);
    }

    #[test]
    fn test_storage_key_layout() {
        assert_eq!(
            storage_key("f1", "c1", "e1", "d1", 2, "my file.pdf"),
            "firms/f1/clients/c1/engagements/e1/documents/d1/v2/my_file.pdf"
        );
    }

    #[test]
    fn test_mime_essence() {
        assert_eq!(essence("Text/Plain; charset=utf-8"), "text/plain");
        assert_eq!(essence("application/pdf"), "application/pdf");
    }

    #[test]
    fn test_status_parse() {
        for status in DocumentStatus::ALL {
            assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
        }
        assert!("archived".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn test_query_defaults() {
        let q: DocumentQuery = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(q.sort_by, DocumentSortBy::UpdatedAt);
        assert_eq!(q.sort_direction, SortDirection::Desc);

        let q: DocumentQuery = serde_json::from_value(serde_json::json!({
            "status": "in_review",
            "sort_by": "file_name",
            "sort_direction": "asc",
            "uploaded_date_start": "2025-01-31"
        }))
        .unwrap();
        assert_eq!(q.status, Some(InReview));
        assert_eq!(q.sort_by, DocumentSortBy::FileName);
        assert_eq!(
            q.uploaded_date_start,
            NaiveDate::from_ymd_opt(2025, 1, 31)
        );
    }

    mod version_race {
        use super::super::*;
        use crate::blob::LocalBlobStore;
        use crate::entities::{client, engagement, user, AuditLog};
        use sea_orm_migration::MigratorTrait;
        use tempfile::TempDir;

        struct Fixture {
            _dir: TempDir,
            db: DatabaseConnection,
            blobs: LocalBlobStore,
            svc: DocumentService,
            admin: AuthUser,
            client_id: String,
            engagement_id: String,
        }

        async fn fixture() -> Fixture {
            let dir = TempDir::new().unwrap();
            let url = format!("sqlite://{}?mode=rwc", dir.path().join("race.db").display());
            let db = sea_orm::Database::connect(&url).await.unwrap();
            migration::Migrator::up(&db, None).await.unwrap();

            let firm = storage::create_firm(&db, "Race Firm").await.unwrap();
            let admin = user::ActiveModel {
                id: Set(storage::new_id()),
                firm_id: Set(firm.id.clone()),
                email: Set("admin@race.test".to_string()),
                name: Set("Ada Admin".to_string()),
                role: Set(Role::Admin.as_str().to_string()),
                password_hash: Set("!".to_string()),
                created_at: Set(storage::now()),
                last_login_at: Set(None),
            }
            .insert(&db)
            .await
            .unwrap();
            let client = client::ActiveModel {
                id: Set(storage::new_id()),
                firm_id: Set(firm.id.clone()),
                name: Set("Acme Pty Ltd".to_string()),
                external_reference: Set(None),
                status: Set("active".to_string()),
                created_at: Set(storage::now()),
            }
            .insert(&db)
            .await
            .unwrap();
            let engagement = engagement::ActiveModel {
                id: Set(storage::new_id()),
                firm_id: Set(firm.id.clone()),
                client_id: Set(client.id.clone()),
                name: Set("Annual return".to_string()),
                financial_year: Set("FY2025".to_string()),
                status: Set("open".to_string()),
                due_date: Set(None),
                created_at: Set(storage::now()),
            }
            .insert(&db)
            .await
            .unwrap();

            let blobs = LocalBlobStore::new(
                dir.path().join("blobs"),
                "race-secret",
                "http://docvault.test",
            );
            let svc = DocumentService::new(
                db.clone(),
                Arc::new(blobs.clone()),
                Uploads::default(),
                300,
            );
            Fixture {
                _dir: dir,
                db,
                blobs,
                svc,
                admin: AuthUser {
                    id: admin.id,
                    firm_id: firm.id,
                    email: admin.email,
                    name: admin.name,
                    role: Role::Admin,
                    firm_name: firm.name,
                },
                client_id: client.id,
                engagement_id: engagement.id,
            }
        }

        fn pdf(name: &str, bytes: &[u8]) -> UploadedFile {
            UploadedFile {
                file_name: name.to_string(),
                mime_type: "application/pdf".to_string(),
                bytes: bytes.to_vec(),
            }
        }

        #[tokio::test]
        async fn test_losing_writer_keeps_committed_blob() {
            let f = fixture().await;
            let created = f
                .svc
                .create_document_with_initial_version(
                    &f.admin,
                    NewDocument {
                        client_id: f.client_id.clone(),
                        engagement_id: f.engagement_id.clone(),
                        title: None,
                        document_type: "tax_return".to_string(),
                        file: pdf("a.pdf", b"first"),
                    },
                    None,
                )
                .await
                .unwrap();
            let document_id = created.document.id.clone();
            let winner = f
                .svc
                .create_document_replacement_version(
                    &f.admin,
                    &document_id,
                    pdf("a.pdf", b"winner"),
                    None,
                )
                .await
                .unwrap();
            assert_eq!(winner.version.version_number, 2);
            let audit_before = AuditLog::find().count(&f.db).await.unwrap();

            // A second writer that read the same max version before the winner committed
            let txn = f.db.begin().await.unwrap();
            let result = f
                .svc
                .write_version(txn, &f.admin, &document_id, 2, &pdf("a.pdf", b"loser"), None)
                .await;
            let err = result.expect_err("second writer of v2 must fail");
            assert_eq!(err.code(), "VERSION_CONFLICT");
            assert!(matches!(
                err,
                DocError::VersionConflict { version_number: 2, .. }
            ));

            assert_eq!(
                f.blobs.read_object(&winner.version.storage_key).await.unwrap(),
                b"winner"
            );
            let versions: Vec<i32> = document_version::Entity::find()
                .filter(document_version::Column::DocumentId.eq(document_id.as_str()))
                .order_by_asc(document_version::Column::VersionNumber)
                .all(&f.db)
                .await
                .unwrap()
                .into_iter()
                .map(|v| v.version_number)
                .collect();
            assert_eq!(versions, [1, 2]);
            assert_eq!(AuditLog::find().count(&f.db).await.unwrap(), audit_before);

            // The next writer picks up after the winner
            let next = f
                .svc
                .create_document_replacement_version(
                    &f.admin,
                    &document_id,
                    pdf("a.pdf", b"third"),
                    None,
                )
                .await
                .unwrap();
            assert_eq!(next.version.version_number, 3);
            assert_eq!(
                f.blobs.read_object(&winner.version.storage_key).await.unwrap(),
                b"winner"
            );
        }
    }
}
