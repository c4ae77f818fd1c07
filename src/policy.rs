//! Tenant-scoped authorization predicates.
//!
//! Every predicate checks that the resource exists inside the caller's firm
//! before it looks at the role, so an out-of-tenant resource, a missing
//! resource and a resource the caller may not see all answer `false`.
//! Callers turn a `false` on a resource predicate into [`DocError::NotFound`]
//! via [`ensure`]; static role checks use [`ensure_role`] and surface as
//! [`DocError::Forbidden`].
//!
//! Nothing here caches: each call reads the current assignment rows.

use std::fmt;
use std::str::FromStr;

use sea_orm::sea_query::Query;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde::{Deserialize, Serialize};

use crate::entities::{
    client, client_assignment, document, document_version, engagement, engagement_assignment,
};
use crate::errors::DocError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Staff,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Staff => "staff",
        }
    }

    /// Admins and managers read and write anything inside their own firm.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }
}

impl FromStr for Role {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "staff" => Ok(Role::Staff),
            other => Err(DocError::BadRequest(format!("unknown role `{other}`"))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authenticated caller, as resolved from a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthUser {
    pub id: String,
    pub firm_id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub firm_name: String,
}

impl AuthUser {
    pub fn is_privileged(&self) -> bool {
        self.role.is_privileged()
    }
}

/// Maps a resource predicate result onto the caller-facing error.
pub fn ensure(allowed: bool) -> Result<(), DocError> {
    if allowed {
        Ok(())
    } else {
        Err(DocError::NotFound)
    }
}

/// Maps a static role check onto the caller-facing error.
pub fn ensure_role(allowed: bool) -> Result<(), DocError> {
    if allowed {
        Ok(())
    } else {
        Err(DocError::Forbidden)
    }
}

pub fn can_manage_assignments(role: Role) -> bool {
    role.is_privileged()
}

pub fn can_manage_users(role: Role) -> bool {
    role == Role::Admin
}

// Firm-scoped lookups

pub async fn find_client<C: ConnectionTrait>(
    db: &C,
    firm_id: &str,
    client_id: &str,
) -> Result<Option<client::Model>, DocError> {
    Ok(client::Entity::find()
        .filter(client::Column::Id.eq(client_id))
        .filter(client::Column::FirmId.eq(firm_id))
        .one(db)
        .await?)
}

pub async fn find_engagement<C: ConnectionTrait>(
    db: &C,
    firm_id: &str,
    engagement_id: &str,
) -> Result<Option<engagement::Model>, DocError> {
    Ok(engagement::Entity::find()
        .filter(engagement::Column::Id.eq(engagement_id))
        .filter(engagement::Column::FirmId.eq(firm_id))
        .one(db)
        .await?)
}

/// Soft-deleted documents are treated as absent.
pub async fn find_document<C: ConnectionTrait>(
    db: &C,
    firm_id: &str,
    document_id: &str,
) -> Result<Option<document::Model>, DocError> {
    Ok(document::Entity::find()
        .filter(document::Column::Id.eq(document_id))
        .filter(document::Column::FirmId.eq(firm_id))
        .filter(document::Column::DeletedAt.is_null())
        .one(db)
        .await?)
}

// Clients

pub async fn can_read_client<C: ConnectionTrait>(
    db: &C,
    user: &AuthUser,
    client_id: &str,
) -> Result<bool, DocError> {
    if find_client(db, &user.firm_id, client_id).await?.is_none() {
        return Ok(false);
    }
    if user.is_privileged() {
        return Ok(true);
    }

    let direct = client_assignment::Entity::find()
        .filter(client_assignment::Column::FirmId.eq(user.firm_id.as_str()))
        .filter(client_assignment::Column::ClientId.eq(client_id))
        .filter(client_assignment::Column::UserId.eq(user.id.as_str()))
        .count(db)
        .await?;
    if direct > 0 {
        return Ok(true);
    }

    // An assignment on any engagement of the client also grants visibility
    let via_engagement = engagement_assignment::Entity::find()
        .filter(engagement_assignment::Column::FirmId.eq(user.firm_id.as_str()))
        .filter(engagement_assignment::Column::UserId.eq(user.id.as_str()))
        .filter(
            engagement_assignment::Column::EngagementId.in_subquery(
                Query::select()
                    .column(engagement::Column::Id)
                    .from(engagement::Entity)
                    .and_where(engagement::Column::ClientId.eq(client_id))
                    .and_where(engagement::Column::FirmId.eq(user.firm_id.as_str()))
                    .to_owned(),
            ),
        )
        .count(db)
        .await?;

    Ok(via_engagement > 0)
}

pub async fn can_write_client<C: ConnectionTrait>(
    db: &C,
    user: &AuthUser,
    client_id: &str,
) -> Result<bool, DocError> {
    if find_client(db, &user.firm_id, client_id).await?.is_none() {
        return Ok(false);
    }
    Ok(user.is_privileged())
}

// Engagements

pub async fn can_read_engagement<C: ConnectionTrait>(
    db: &C,
    user: &AuthUser,
    engagement_id: &str,
) -> Result<bool, DocError> {
    if find_engagement(db, &user.firm_id, engagement_id)
        .await?
        .is_none()
    {
        return Ok(false);
    }
    if user.is_privileged() {
        return Ok(true);
    }

    let direct = engagement_assignment::Entity::find()
        .filter(engagement_assignment::Column::FirmId.eq(user.firm_id.as_str()))
        .filter(engagement_assignment::Column::EngagementId.eq(engagement_id))
        .filter(engagement_assignment::Column::UserId.eq(user.id.as_str()))
        .count(db)
        .await?;

    Ok(direct > 0)
}

pub async fn can_write_engagement<C: ConnectionTrait>(
    db: &C,
    user: &AuthUser,
    engagement_id: &str,
) -> Result<bool, DocError> {
    if find_engagement(db, &user.firm_id, engagement_id)
        .await?
        .is_none()
    {
        return Ok(false);
    }
    Ok(user.is_privileged())
}

// Documents

pub async fn can_create_document_version<C: ConnectionTrait>(
    db: &C,
    user: &AuthUser,
    client_id: &str,
    engagement_id: &str,
) -> Result<bool, DocError> {
    if find_client(db, &user.firm_id, client_id).await?.is_none() {
        return Ok(false);
    }
    let engagement = match find_engagement(db, &user.firm_id, engagement_id).await? {
        Some(e) => e,
        None => return Ok(false),
    };
    if engagement.client_id != client_id {
        return Ok(false);
    }
    Ok(user.is_privileged())
}

pub async fn can_read_document<C: ConnectionTrait>(
    db: &C,
    user: &AuthUser,
    document_id: &str,
) -> Result<bool, DocError> {
    match find_document(db, &user.firm_id, document_id).await? {
        Some(doc) => can_read_engagement(db, user, &doc.engagement_id).await,
        None => Ok(false),
    }
}

pub async fn can_write_document<C: ConnectionTrait>(
    db: &C,
    user: &AuthUser,
    document_id: &str,
) -> Result<bool, DocError> {
    match find_document(db, &user.firm_id, document_id).await? {
        Some(doc) => can_write_engagement(db, user, &doc.engagement_id).await,
        None => Ok(false),
    }
}

pub async fn can_read_document_version<C: ConnectionTrait>(
    db: &C,
    user: &AuthUser,
    document_id: &str,
    version_number: i32,
) -> Result<bool, DocError> {
    if find_document(db, &user.firm_id, document_id)
        .await?
        .is_none()
    {
        return Ok(false);
    }

    let version = document_version::Entity::find()
        .filter(document_version::Column::DocumentId.eq(document_id))
        .filter(document_version::Column::VersionNumber.eq(version_number))
        .count(db)
        .await?;
    if version == 0 {
        return Ok(false);
    }

    can_read_document(db, user, document_id).await
}
