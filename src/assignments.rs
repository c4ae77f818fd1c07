//! Grants that connect staff to clients and engagements.
//!
//! Every mutation writes its row change and its `permission_change` audit
//! event in one transaction. Assigning twice leaves one row but two audit
//! events; unassigning a missing grant is still audited.

use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::Serialize;

use crate::audit::{self, AssignmentChange, AuditMetadata, PermissionChangeMeta, RequestContext};
use crate::entities::{client, client_assignment, engagement, engagement_assignment, user};
use crate::errors::DocError;
use crate::policy::{self, AuthUser};
use crate::storage;

#[derive(Debug, Clone, Serialize)]
pub struct UserAssignments {
    pub user_id: String,
    pub clients: Vec<client_assignment::Model>,
    pub engagements: Vec<engagement_assignment::Model>,
}

fn permission_change(
    change: AssignmentChange,
    target_user_id: &str,
    client_id: &str,
    engagement_id: Option<&str>,
) -> AuditMetadata {
    AuditMetadata::PermissionChange(PermissionChangeMeta {
        change,
        target_user_id: target_user_id.to_string(),
        client_id: Some(client_id.to_string()),
        engagement_id: engagement_id.map(str::to_string),
    })
}

pub async fn assign_client(
    db: &DatabaseConnection,
    actor: &AuthUser,
    client_id: &str,
    user_id: &str,
    ctx: Option<&RequestContext>,
) -> Result<client_assignment::Model, DocError> {
    policy::ensure_role(policy::can_manage_assignments(actor.role))?;

    let txn = db.begin().await?;
    policy::find_client(&txn, &actor.firm_id, client_id)
        .await?
        .ok_or(DocError::NotFound)?;
    storage::get_firm_user(&txn, &actor.firm_id, user_id)
        .await?
        .ok_or(DocError::NotFound)?;

    let existing = client_assignment::Entity::find()
        .filter(client_assignment::Column::FirmId.eq(actor.firm_id.as_str()))
        .filter(client_assignment::Column::ClientId.eq(client_id))
        .filter(client_assignment::Column::UserId.eq(user_id))
        .one(&txn)
        .await?;

    let row = match existing {
        Some(row) => row,
        None => {
            client_assignment::ActiveModel {
                id: Set(storage::new_id()),
                firm_id: Set(actor.firm_id.clone()),
                client_id: Set(client_id.to_string()),
                user_id: Set(user_id.to_string()),
                created_at: Set(storage::now()),
                created_by_user_id: Set(actor.id.clone()),
            }
            .insert(&txn)
            .await?
        }
    };

    audit::log_audit_event(
        &txn,
        &actor.firm_id,
        &actor.id,
        "client",
        client_id,
        &permission_change(AssignmentChange::Assign, user_id, client_id, None),
        ctx,
    )
    .await?;
    txn.commit().await?;

    tracing::info!(firm_id = %actor.firm_id, client_id, user_id, "client assigned");
    Ok(row)
}

/// Returns how many rows were removed (0 or 1).
pub async fn unassign_client(
    db: &DatabaseConnection,
    actor: &AuthUser,
    client_id: &str,
    user_id: &str,
    ctx: Option<&RequestContext>,
) -> Result<u64, DocError> {
    policy::ensure_role(policy::can_manage_assignments(actor.role))?;

    let txn = db.begin().await?;
    let deleted = client_assignment::Entity::delete_many()
        .filter(client_assignment::Column::FirmId.eq(actor.firm_id.as_str()))
        .filter(client_assignment::Column::ClientId.eq(client_id))
        .filter(client_assignment::Column::UserId.eq(user_id))
        .exec(&txn)
        .await?
        .rows_affected;

    audit::log_audit_event(
        &txn,
        &actor.firm_id,
        &actor.id,
        "client",
        client_id,
        &permission_change(AssignmentChange::Unassign, user_id, client_id, None),
        ctx,
    )
    .await?;
    txn.commit().await?;

    tracing::info!(firm_id = %actor.firm_id, client_id, user_id, deleted, "client unassigned");
    Ok(deleted)
}

pub async fn assign_engagement(
    db: &DatabaseConnection,
    actor: &AuthUser,
    engagement_id: &str,
    user_id: &str,
    ctx: Option<&RequestContext>,
) -> Result<engagement_assignment::Model, DocError> {
    policy::ensure_role(policy::can_manage_assignments(actor.role))?;

    let txn = db.begin().await?;
    let engagement = policy::find_engagement(&txn, &actor.firm_id, engagement_id)
        .await?
        .ok_or(DocError::NotFound)?;
    storage::get_firm_user(&txn, &actor.firm_id, user_id)
        .await?
        .ok_or(DocError::NotFound)?;

    let existing = engagement_assignment::Entity::find()
        .filter(engagement_assignment::Column::FirmId.eq(actor.firm_id.as_str()))
        .filter(engagement_assignment::Column::EngagementId.eq(engagement_id))
        .filter(engagement_assignment::Column::UserId.eq(user_id))
        .one(&txn)
        .await?;

    let row = match existing {
        Some(row) => row,
        None => {
            engagement_assignment::ActiveModel {
                id: Set(storage::new_id()),
                firm_id: Set(actor.firm_id.clone()),
                engagement_id: Set(engagement_id.to_string()),
                user_id: Set(user_id.to_string()),
                created_at: Set(storage::now()),
                created_by_user_id: Set(actor.id.clone()),
            }
            .insert(&txn)
            .await?
        }
    };

    audit::log_audit_event(
        &txn,
        &actor.firm_id,
        &actor.id,
        "engagement",
        engagement_id,
        &permission_change(
            AssignmentChange::Assign,
            user_id,
            &engagement.client_id,
            Some(engagement_id),
        ),
        ctx,
    )
    .await?;
    txn.commit().await?;

    tracing::info!(firm_id = %actor.firm_id, engagement_id, user_id, "engagement assigned");
    Ok(row)
}

pub async fn unassign_engagement(
    db: &DatabaseConnection,
    actor: &AuthUser,
    engagement_id: &str,
    user_id: &str,
    ctx: Option<&RequestContext>,
) -> Result<u64, DocError> {
    policy::ensure_role(policy::can_manage_assignments(actor.role))?;

    let txn = db.begin().await?;
    // The engagement may be gone; the audit row still records the attempt
    let client_id = policy::find_engagement(&txn, &actor.firm_id, engagement_id)
        .await?
        .map(|e| e.client_id);

    let deleted = engagement_assignment::Entity::delete_many()
        .filter(engagement_assignment::Column::FirmId.eq(actor.firm_id.as_str()))
        .filter(engagement_assignment::Column::EngagementId.eq(engagement_id))
        .filter(engagement_assignment::Column::UserId.eq(user_id))
        .exec(&txn)
        .await?
        .rows_affected;

    let metadata = AuditMetadata::PermissionChange(PermissionChangeMeta {
        change: AssignmentChange::Unassign,
        target_user_id: user_id.to_string(),
        client_id,
        engagement_id: Some(engagement_id.to_string()),
    });
    audit::log_audit_event(
        &txn,
        &actor.firm_id,
        &actor.id,
        "engagement",
        engagement_id,
        &metadata,
        ctx,
    )
    .await?;
    txn.commit().await?;

    tracing::info!(firm_id = %actor.firm_id, engagement_id, user_id, deleted, "engagement unassigned");
    Ok(deleted)
}

// Listings

pub async fn list_users_for_firm(
    db: &DatabaseConnection,
    firm_id: &str,
) -> Result<Vec<user::Model>, DocError> {
    Ok(user::Entity::find()
        .filter(user::Column::FirmId.eq(firm_id))
        .order_by_asc(user::Column::Name)
        .order_by_asc(user::Column::Email)
        .all(db)
        .await?)
}

pub async fn get_user_assignments(
    db: &DatabaseConnection,
    firm_id: &str,
    user_id: &str,
) -> Result<UserAssignments, DocError> {
    storage::get_firm_user(db, firm_id, user_id)
        .await?
        .ok_or(DocError::NotFound)?;

    let clients = client_assignment::Entity::find()
        .filter(client_assignment::Column::FirmId.eq(firm_id))
        .filter(client_assignment::Column::UserId.eq(user_id))
        .order_by_asc(client_assignment::Column::CreatedAt)
        .order_by_asc(client_assignment::Column::Id)
        .all(db)
        .await?;

    let engagements = engagement_assignment::Entity::find()
        .filter(engagement_assignment::Column::FirmId.eq(firm_id))
        .filter(engagement_assignment::Column::UserId.eq(user_id))
        .order_by_asc(engagement_assignment::Column::CreatedAt)
        .order_by_asc(engagement_assignment::Column::Id)
        .all(db)
        .await?;

    Ok(UserAssignments {
        user_id: user_id.to_string(),
        clients,
        engagements,
    })
}

pub async fn list_firm_clients(
    db: &DatabaseConnection,
    firm_id: &str,
) -> Result<Vec<client::Model>, DocError> {
    Ok(client::Entity::find()
        .filter(client::Column::FirmId.eq(firm_id))
        .order_by_asc(client::Column::Name)
        .all(db)
        .await?)
}

pub async fn list_firm_engagements(
    db: &DatabaseConnection,
    firm_id: &str,
) -> Result<Vec<engagement::Model>, DocError> {
    Ok(engagement::Entity::find()
        .filter(engagement::Column::FirmId.eq(firm_id))
        .order_by_asc(engagement::Column::ClientId)
        .order_by_asc(engagement::Column::FinancialYear)
        .order_by_asc(engagement::Column::Name)
        .all(db)
        .await?)
}
