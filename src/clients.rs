use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use sea_orm::sea_query::Query;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{self, AuditMetadata, RequestContext};
use crate::entities::{client, client_assignment, engagement, engagement_assignment};
use crate::errors::DocError;
use crate::policy::{self, AuthUser};
use crate::storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Active,
    Archived,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Active => "active",
            ClientStatus::Archived => "archived",
        }
    }
}

impl FromStr for ClientStatus {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ClientStatus::Active),
            "archived" => Ok(ClientStatus::Archived),
            other => Err(DocError::BadRequest(format!("unknown client status `{other}`"))),
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementStatus {
    Open,
    Closed,
}

impl EngagementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementStatus::Open => "open",
            EngagementStatus::Closed => "closed",
        }
    }
}

impl FromStr for EngagementStatus {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(EngagementStatus::Open),
            "closed" => Ok(EngagementStatus::Closed),
            other => Err(DocError::BadRequest(format!(
                "unknown engagement status `{other}`"
            ))),
        }
    }
}

impl fmt::Display for EngagementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewClient {
    pub name: String,
    #[serde(default)]
    pub external_reference: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientUpdate {
    pub name: Option<String>,
    pub external_reference: Option<String>,
    pub status: Option<ClientStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewEngagement {
    pub client_id: String,
    pub name: String,
    pub financial_year: String,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngagementUpdate {
    pub name: Option<String>,
    pub financial_year: Option<String>,
    pub status: Option<EngagementStatus>,
    pub due_date: Option<NaiveDate>,
}

fn required(value: &str, field: &str) -> Result<String, DocError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DocError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(value.to_string())
}

// Clients

pub async fn create_client(
    db: &DatabaseConnection,
    actor: &AuthUser,
    input: NewClient,
    ctx: Option<&RequestContext>,
) -> Result<client::Model, DocError> {
    policy::ensure_role(actor.is_privileged())?;
    let name = required(&input.name, "name")?;

    let txn = db.begin().await?;
    let model = client::ActiveModel {
        id: Set(storage::new_id()),
        firm_id: Set(actor.firm_id.clone()),
        name: Set(name),
        external_reference: Set(input.external_reference.filter(|r| !r.trim().is_empty())),
        status: Set(ClientStatus::Active.as_str().to_string()),
        created_at: Set(storage::now()),
    }
    .insert(&txn)
    .await?;

    audit::log_audit_event(
        &txn,
        &actor.firm_id,
        &actor.id,
        "client",
        &model.id,
        &AuditMetadata::other(
            "client.create",
            json!({ "clientId": model.id, "name": model.name }),
        ),
        ctx,
    )
    .await?;
    txn.commit().await?;

    tracing::info!(firm_id = %actor.firm_id, client_id = %model.id, "client created");
    Ok(model)
}

pub async fn update_client(
    db: &DatabaseConnection,
    actor: &AuthUser,
    client_id: &str,
    update: ClientUpdate,
    ctx: Option<&RequestContext>,
) -> Result<client::Model, DocError> {
    policy::ensure(policy::can_write_client(db, actor, client_id).await?)?;

    let txn = db.begin().await?;
    let existing = policy::find_client(&txn, &actor.firm_id, client_id)
        .await?
        .ok_or(DocError::NotFound)?;

    let mut active: client::ActiveModel = existing.into();
    if let Some(name) = &update.name {
        active.name = Set(required(name, "name")?);
    }
    if let Some(reference) = &update.external_reference {
        let reference = reference.trim();
        active.external_reference = Set((!reference.is_empty()).then(|| reference.to_string()));
    }
    if let Some(status) = update.status {
        active.status = Set(status.as_str().to_string());
    }
    let model = active.update(&txn).await?;

    audit::log_audit_event(
        &txn,
        &actor.firm_id,
        &actor.id,
        "client",
        client_id,
        &AuditMetadata::other(
            "client.update",
            json!({ "clientId": client_id, "name": model.name, "status": model.status }),
        ),
        ctx,
    )
    .await?;
    txn.commit().await?;

    Ok(model)
}

pub async fn get_client(
    db: &DatabaseConnection,
    actor: &AuthUser,
    client_id: &str,
) -> Result<client::Model, DocError> {
    policy::ensure(policy::can_read_client(db, actor, client_id).await?)?;
    policy::find_client(db, &actor.firm_id, client_id)
        .await?
        .ok_or(DocError::NotFound)
}

/// Privileged users see the whole firm. Staff see clients they are assigned
/// to directly or through one of the client's engagements.
pub async fn list_visible_clients(
    db: &DatabaseConnection,
    actor: &AuthUser,
) -> Result<Vec<client::Model>, DocError> {
    let mut select = client::Entity::find().filter(client::Column::FirmId.eq(actor.firm_id.as_str()));

    if !actor.is_privileged() {
        let direct = Query::select()
            .column(client_assignment::Column::ClientId)
            .from(client_assignment::Entity)
            .and_where(client_assignment::Column::FirmId.eq(actor.firm_id.as_str()))
            .and_where(client_assignment::Column::UserId.eq(actor.id.as_str()))
            .to_owned();
        let via_engagement = Query::select()
            .column(engagement::Column::ClientId)
            .from(engagement::Entity)
            .and_where(engagement::Column::FirmId.eq(actor.firm_id.as_str()))
            .and_where(engagement::Column::Id.in_subquery(assigned_engagements(actor)))
            .to_owned();

        select = select.filter(
            Condition::any()
                .add(client::Column::Id.in_subquery(direct))
                .add(client::Column::Id.in_subquery(via_engagement)),
        );
    }

    Ok(select.order_by_asc(client::Column::Name).all(db).await?)
}

/// Engagement ids the actor holds a direct grant on.
pub(crate) fn assigned_engagements(actor: &AuthUser) -> sea_orm::sea_query::SelectStatement {
    Query::select()
        .column(engagement_assignment::Column::EngagementId)
        .from(engagement_assignment::Entity)
        .and_where(engagement_assignment::Column::FirmId.eq(actor.firm_id.as_str()))
        .and_where(engagement_assignment::Column::UserId.eq(actor.id.as_str()))
        .to_owned()
}

// Engagements

pub async fn create_engagement(
    db: &DatabaseConnection,
    actor: &AuthUser,
    input: NewEngagement,
    ctx: Option<&RequestContext>,
) -> Result<engagement::Model, DocError> {
    policy::ensure_role(actor.is_privileged())?;
    policy::ensure(policy::can_write_client(db, actor, &input.client_id).await?)?;
    let name = required(&input.name, "name")?;
    let financial_year = required(&input.financial_year, "financial_year")?;

    let txn = db.begin().await?;
    let model = engagement::ActiveModel {
        id: Set(storage::new_id()),
        firm_id: Set(actor.firm_id.clone()),
        client_id: Set(input.client_id.clone()),
        name: Set(name),
        financial_year: Set(financial_year),
        status: Set(EngagementStatus::Open.as_str().to_string()),
        due_date: Set(input.due_date.map(|d| d.format("%Y-%m-%d").to_string())),
        created_at: Set(storage::now()),
    }
    .insert(&txn)
    .await?;

    audit::log_audit_event(
        &txn,
        &actor.firm_id,
        &actor.id,
        "engagement",
        &model.id,
        &AuditMetadata::other(
            "engagement.create",
            json!({
                "clientId": model.client_id,
                "engagementId": model.id,
                "name": model.name,
                "financialYear": model.financial_year,
            }),
        ),
        ctx,
    )
    .await?;
    txn.commit().await?;

    tracing::info!(
        firm_id = %actor.firm_id,
        client_id = %model.client_id,
        engagement_id = %model.id,
        "engagement created"
    );
    Ok(model)
}

pub async fn update_engagement(
    db: &DatabaseConnection,
    actor: &AuthUser,
    engagement_id: &str,
    update: EngagementUpdate,
    ctx: Option<&RequestContext>,
) -> Result<engagement::Model, DocError> {
    policy::ensure(policy::can_write_engagement(db, actor, engagement_id).await?)?;

    let txn = db.begin().await?;
    let existing = policy::find_engagement(&txn, &actor.firm_id, engagement_id)
        .await?
        .ok_or(DocError::NotFound)?;

    let mut active: engagement::ActiveModel = existing.into();
    if let Some(name) = &update.name {
        active.name = Set(required(name, "name")?);
    }
    if let Some(year) = &update.financial_year {
        active.financial_year = Set(required(year, "financial_year")?);
    }
    if let Some(status) = update.status {
        active.status = Set(status.as_str().to_string());
    }
    if let Some(due) = update.due_date {
        active.due_date = Set(Some(due.format("%Y-%m-%d").to_string()));
    }
    let model = active.update(&txn).await?;

    audit::log_audit_event(
        &txn,
        &actor.firm_id,
        &actor.id,
        "engagement",
        engagement_id,
        &AuditMetadata::other(
            "engagement.update",
            json!({
                "clientId": model.client_id,
                "engagementId": model.id,
                "name": model.name,
                "status": model.status,
            }),
        ),
        ctx,
    )
    .await?;
    txn.commit().await?;

    Ok(model)
}

pub async fn get_engagement(
    db: &DatabaseConnection,
    actor: &AuthUser,
    engagement_id: &str,
) -> Result<engagement::Model, DocError> {
    policy::ensure(policy::can_read_engagement(db, actor, engagement_id).await?)?;
    policy::find_engagement(db, &actor.firm_id, engagement_id)
        .await?
        .ok_or(DocError::NotFound)
}

/// Staff see only engagements they hold a direct grant on.
pub async fn list_visible_engagements(
    db: &DatabaseConnection,
    actor: &AuthUser,
    client_id: Option<&str>,
) -> Result<Vec<engagement::Model>, DocError> {
    let mut select =
        engagement::Entity::find().filter(engagement::Column::FirmId.eq(actor.firm_id.as_str()));

    if let Some(client_id) = client_id {
        select = select.filter(engagement::Column::ClientId.eq(client_id));
    }
    if !actor.is_privileged() {
        select = select.filter(engagement::Column::Id.in_subquery(assigned_engagements(actor)));
    }

    Ok(select
        .order_by_asc(engagement::Column::ClientId)
        .order_by_asc(engagement::Column::FinancialYear)
        .order_by_asc(engagement::Column::Name)
        .all(db)
        .await?)
}
