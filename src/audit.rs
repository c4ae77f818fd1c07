//! Append-only audit trail.
//!
//! Writers call [`log_audit_event`] with the same connection (usually a
//! transaction) as the mutation being recorded; a failed audit insert fails
//! the whole operation. Readers go through [`list_audit_events`] and
//! [`export_audit_events_csv`], both firm-scoped.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate};
use sea_orm::sea_query::{Expr, SimpleExpr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbBackend, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Select, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entities::{audit_log, user};
use crate::errors::DocError;
use crate::page::{self, Page};
use crate::policy::{self, AuthUser};
use crate::storage;

/// Metadata keys reserved for the request context.
pub const META_IP: &str = "ip";
pub const META_USER_AGENT: &str = "userAgent";

/// Where a request came from; merged into every audit row it produces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMeta {
    pub client_id: String,
    pub engagement_id: String,
    pub document_id: String,
    pub version_number: i32,
    pub file_name: String,
    pub mime_type: String,
    pub file_size_bytes: i64,
    pub storage_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadMeta {
    pub client_id: String,
    pub engagement_id: String,
    pub document_id: String,
    pub version_number: i32,
    pub file_name: String,
    pub storage_key: String,
    pub expires_in_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeMeta {
    pub client_id: String,
    pub engagement_id: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdateMeta {
    pub document_ids: Vec<String>,
    pub status: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentChange {
    Assign,
    Unassign,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionChangeMeta {
    pub change: AssignmentChange,
    pub target_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engagement_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginMeta {
    pub email: String,
}

/// Known metadata shapes keyed by action, plus a catch-all for everything else.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditMetadata {
    Upload(UploadMeta),
    Download(DownloadMeta),
    StatusChange(StatusChangeMeta),
    BulkUpdate(BulkUpdateMeta),
    PermissionChange(PermissionChangeMeta),
    Login(LoginMeta),
    Logout,
    Other {
        action: String,
        data: Map<String, Value>,
    },
}

impl AuditMetadata {
    pub fn action(&self) -> &str {
        match self {
            AuditMetadata::Upload(_) => "upload",
            AuditMetadata::Download(_) => "download",
            AuditMetadata::StatusChange(_) => "status_change",
            AuditMetadata::BulkUpdate(_) => "bulk_update",
            AuditMetadata::PermissionChange(_) => "permission_change",
            AuditMetadata::Login(_) => "auth.login",
            AuditMetadata::Logout => "auth.logout",
            AuditMetadata::Other { action, .. } => action,
        }
    }

    /// Catch-all constructor for actions without a dedicated shape.
    pub fn other(action: &str, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        AuditMetadata::Other {
            action: action.to_string(),
            data,
        }
    }

    pub fn to_map(&self) -> Result<Map<String, Value>, DocError> {
        let value = match self {
            AuditMetadata::Upload(m) => serde_json::to_value(m)?,
            AuditMetadata::Download(m) => serde_json::to_value(m)?,
            AuditMetadata::StatusChange(m) => serde_json::to_value(m)?,
            AuditMetadata::BulkUpdate(m) => serde_json::to_value(m)?,
            AuditMetadata::PermissionChange(m) => serde_json::to_value(m)?,
            AuditMetadata::Login(m) => serde_json::to_value(m)?,
            AuditMetadata::Logout => Value::Object(Map::new()),
            AuditMetadata::Other { data, .. } => Value::Object(data.clone()),
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(DocError::Other("audit metadata must be an object".into())),
        }
    }
}

/// Inserts one immutable audit row. Errors are returned, never swallowed.
pub async fn log_audit_event<C: ConnectionTrait>(
    db: &C,
    firm_id: &str,
    user_id: &str,
    entity_type: &str,
    entity_id: &str,
    metadata: &AuditMetadata,
    ctx: Option<&RequestContext>,
) -> Result<audit_log::Model, DocError> {
    let mut map = metadata.to_map()?;
    if let Some(ctx) = ctx {
        if let Some(ip) = &ctx.ip_address {
            map.insert(META_IP.to_string(), Value::String(ip.clone()));
        }
        if let Some(ua) = &ctx.user_agent {
            map.insert(META_USER_AGENT.to_string(), Value::String(ua.clone()));
        }
    }

    let row = audit_log::ActiveModel {
        id: Set(storage::new_id()),
        firm_id: Set(firm_id.to_string()),
        user_id: Set(user_id.to_string()),
        action: Set(metadata.action().to_string()),
        entity_type: Set(entity_type.to_string()),
        entity_id: Set(entity_id.to_string()),
        metadata: Set(serde_json::to_string(&Value::Object(map))?),
        created_at: Set(storage::now()),
    };

    let model = row.insert(db).await?;
    tracing::debug!(
        firm_id,
        user_id,
        action = %model.action,
        entity_type,
        entity_id,
        "audit event recorded"
    );
    Ok(model)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub action: Option<String>,
    pub entity_type: Option<String>,
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub engagement_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEventView {
    pub id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub metadata: Value,
    pub summary: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditCsvExport {
    pub csv: String,
    pub truncated: bool,
    pub row_count: usize,
    pub max_rows: u64,
}

/// JSON-path equality on one top-level metadata key.
fn metadata_field_eq(backend: DbBackend, field: &str, value: &str) -> SimpleExpr {
    match backend {
        DbBackend::Postgres => Expr::cust_with_values(
            r#"("audit_logs"."metadata"::jsonb ->> ?) = ?"#,
            [field.to_string(), value.to_string()],
        ),
        DbBackend::MySql => Expr::cust_with_values(
            "JSON_UNQUOTE(JSON_EXTRACT(`audit_logs`.`metadata`, ?)) = ?",
            [format!("$.{field}"), value.to_string()],
        ),
        _ => Expr::cust_with_values(
            r#"json_extract("audit_logs"."metadata", ?) = ?"#,
            [format!("$.{field}"), value.to_string()],
        ),
    }
}

/// Shared filter shape for the page, its total and the CSV export.
fn filtered(backend: DbBackend, firm_id: &str, query: &AuditQuery) -> Select<audit_log::Entity> {
    let mut select = audit_log::Entity::find().filter(audit_log::Column::FirmId.eq(firm_id));

    if let Some(start) = query.start_date {
        select = select.filter(audit_log::Column::CreatedAt.gte(page::start_of_day(start)));
    }
    if let Some(end) = query.end_date {
        select = select.filter(audit_log::Column::CreatedAt.lt(page::end_of_day_exclusive(end)));
    }
    if let Some(action) = non_empty(&query.action) {
        select = select.filter(audit_log::Column::Action.eq(action));
    }
    if let Some(entity_type) = non_empty(&query.entity_type) {
        select = select.filter(audit_log::Column::EntityType.eq(entity_type));
    }
    if let Some(user_id) = non_empty(&query.user_id) {
        select = select.filter(audit_log::Column::UserId.eq(user_id));
    }
    if let Some(client_id) = non_empty(&query.client_id) {
        select = select.filter(metadata_field_eq(backend, "clientId", client_id));
    }
    if let Some(engagement_id) = non_empty(&query.engagement_id) {
        select = select.filter(metadata_field_eq(backend, "engagementId", engagement_id));
    }

    select
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Staff only ever see their own events; asking for someone else's fails closed.
fn scope_query(user: &AuthUser, query: &AuditQuery) -> Result<AuditQuery, DocError> {
    let mut scoped = query.clone();
    if !user.is_privileged() {
        match non_empty(&query.user_id) {
            Some(requested) if requested != user.id => return Err(DocError::Forbidden),
            _ => scoped.user_id = Some(user.id.clone()),
        }
    }
    Ok(scoped)
}

async fn load_actors<C: ConnectionTrait>(
    db: &C,
    firm_id: &str,
    rows: &[audit_log::Model],
) -> Result<HashMap<String, user::Model>, DocError> {
    let mut ids: Vec<String> = rows.iter().map(|r| r.user_id.clone()).collect();
    ids.sort();
    ids.dedup();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let users = user::Entity::find()
        .filter(user::Column::FirmId.eq(firm_id))
        .filter(user::Column::Id.is_in(ids))
        .all(db)
        .await?;

    Ok(users.into_iter().map(|u| (u.id.clone(), u)).collect())
}

fn to_view(row: audit_log::Model, actors: &HashMap<String, user::Model>) -> AuditEventView {
    let metadata: Value =
        serde_json::from_str(&row.metadata).unwrap_or_else(|_| Value::Object(Map::new()));
    let summary = format_audit_summary(&row.action, &row.entity_type, &metadata);
    let actor = actors.get(&row.user_id);

    AuditEventView {
        id: row.id,
        user_name: actor.map(|u| u.name.clone()),
        user_email: actor.map(|u| u.email.clone()),
        user_id: row.user_id,
        action: row.action,
        entity_type: row.entity_type,
        entity_id: row.entity_id,
        metadata,
        summary,
        created_at: row.created_at,
    }
}

pub async fn list_audit_events<C: ConnectionTrait>(
    db: &C,
    user: &AuthUser,
    query: &AuditQuery,
) -> Result<Page<AuditEventView>, DocError> {
    let query = scope_query(user, query)?;
    let limit = page::clamp_limit(query.limit);
    let offset = query.offset.unwrap_or(0);

    let select = filtered(db.get_database_backend(), &user.firm_id, &query);
    let total = select.clone().count(db).await?;
    let rows = select
        .order_by_desc(audit_log::Column::CreatedAt)
        .order_by_desc(audit_log::Column::Id)
        .limit(limit)
        .offset(offset)
        .all(db)
        .await?;

    let actors = load_actors(db, &user.firm_id, &rows).await?;
    let items = rows.into_iter().map(|r| to_view(r, &actors)).collect();

    Ok(Page {
        items,
        total,
        limit,
        offset,
    })
}

const CSV_HEADER: [&str; 8] = [
    "created_at",
    "user_id",
    "user_email",
    "action",
    "entity_type",
    "entity_id",
    "summary",
    "metadata",
];

/// Privileged-only export. Reads one row past the cap to detect truncation.
pub async fn export_audit_events_csv<C: ConnectionTrait>(
    db: &C,
    user: &AuthUser,
    query: &AuditQuery,
    max_rows: u64,
) -> Result<AuditCsvExport, DocError> {
    policy::ensure_role(user.is_privileged())?;

    let mut rows = filtered(db.get_database_backend(), &user.firm_id, query)
        .order_by_desc(audit_log::Column::CreatedAt)
        .order_by_desc(audit_log::Column::Id)
        .limit(max_rows.saturating_add(1).min(i64::MAX as u64))
        .all(db)
        .await?;

    let truncated = rows.len() as u64 > max_rows;
    rows.truncate(usize::try_from(max_rows).unwrap_or(usize::MAX));

    let actors = load_actors(db, &user.firm_id, &rows).await?;
    let mut csv = csv_line(CSV_HEADER.iter().map(|s| s.to_string()));
    let row_count = rows.len();
    for row in rows {
        let created = DateTime::from_timestamp(row.created_at, 0)
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| row.created_at.to_string());
        let view = to_view(row, &actors);
        csv.push_str(&csv_line([
            created,
            view.user_id,
            view.user_email.unwrap_or_default(),
            view.action,
            view.entity_type,
            view.entity_id,
            view.summary,
            view.metadata.to_string(),
        ]));
    }

    if truncated {
        tracing::info!(
            firm_id = %user.firm_id,
            max_rows,
            "audit export truncated"
        );
    }

    Ok(AuditCsvExport {
        csv,
        truncated,
        row_count,
        max_rows,
    })
}

fn csv_line<I: IntoIterator<Item = String>>(fields: I) -> String {
    let mut line = fields
        .into_iter()
        .map(|f| csv_field(&f))
        .collect::<Vec<_>>()
        .join(",");
    line.push_str("\r\n");
    line
}

/// RFC 4180 quoting. Cells that a spreadsheet would evaluate as a formula
/// are prefixed with a single quote.
fn csv_field(value: &str) -> String {
    let value = if value.starts_with(['=', '+', '-', '@']) {
        format!("'{value}")
    } else {
        value.to_string()
    };
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value
    }
}

fn meta_str<'a>(metadata: &'a Value, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(Value::as_str)
}

fn meta_i64(metadata: &Value, key: &str) -> Option<i64> {
    metadata.get(key).and_then(Value::as_i64)
}

/// One-line human description of an audit row. Total: never panics, and
/// falls back to `"{action} on {entity_type}"` for anything it does not know.
pub fn format_audit_summary(action: &str, entity_type: &str, metadata: &Value) -> String {
    let fallback = || format!("{action} on {entity_type}");

    match action {
        "upload" => {
            let file = meta_str(metadata, "fileName").unwrap_or("a file");
            match meta_i64(metadata, "versionNumber") {
                Some(n) if n > 1 => format!("Uploaded version {n} of {file}"),
                _ => format!("Uploaded {file}"),
            }
        }
        "download" => {
            let file = meta_str(metadata, "fileName").unwrap_or("a file");
            match meta_i64(metadata, "versionNumber") {
                Some(n) => format!("Issued download link for {file} (v{n})"),
                None => format!("Issued download link for {file}"),
            }
        }
        "status_change" => match (meta_str(metadata, "from"), meta_str(metadata, "to")) {
            (Some(from), Some(to)) if from == to => format!("Confirmed {entity_type} status {to}"),
            (Some(from), Some(to)) => format!("Changed {entity_type} status from {from} to {to}"),
            (None, Some(to)) => format!("Changed {entity_type} status to {to}"),
            _ => fallback(),
        },
        "bulk_update" => {
            let count = meta_i64(metadata, "count").unwrap_or(0);
            match meta_str(metadata, "status") {
                Some(status) => format!("Set {count} documents to {status}"),
                None => format!("Updated {count} documents"),
            }
        }
        "permission_change" => {
            let target = meta_str(metadata, "targetUserId").unwrap_or("a user");
            match meta_str(metadata, "change") {
                Some("assign") => format!("Assigned {target} to {entity_type}"),
                Some("unassign") => format!("Removed {target} from {entity_type}"),
                _ => fallback(),
            }
        }
        "auth.login" => match meta_str(metadata, "email") {
            Some(email) => format!("Signed in as {email}"),
            None => "Signed in".to_string(),
        },
        "auth.logout" => "Signed out".to_string(),
        "client.create" | "engagement.create" => match meta_str(metadata, "name") {
            Some(name) => format!("Created {entity_type} {name}"),
            None => fallback(),
        },
        "client.update" | "engagement.update" => match meta_str(metadata, "name") {
            Some(name) => format!("Updated {entity_type} {name}"),
            None => format!("Updated {entity_type}"),
        },
        "document.delete" => match meta_str(metadata, "title") {
            Some(title) => format!("Deleted document {title}"),
            None => fallback(),
        },
        _ => fallback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_known_actions_serialize_flat_camel_case() {
        let meta = AuditMetadata::StatusChange(StatusChangeMeta {
            client_id: "c1".into(),
            engagement_id: "e1".into(),
            from: "uploaded".into(),
            to: "in_review".into(),
        });
        assert_eq!(meta.action(), "status_change");
        let map = meta.to_map().unwrap();
        assert_eq!(map.get("clientId"), Some(&json!("c1")));
        assert_eq!(map.get("engagementId"), Some(&json!("e1")));
        assert_eq!(map.get("to"), Some(&json!("in_review")));
    }

    #[test]
    fn test_permission_change_omits_missing_scope() {
        let meta = AuditMetadata::PermissionChange(PermissionChangeMeta {
            change: AssignmentChange::Unassign,
            target_user_id: "u2".into(),
            client_id: Some("c1".into()),
            engagement_id: None,
        });
        let map = meta.to_map().unwrap();
        assert_eq!(map.get("change"), Some(&json!("unassign")));
        assert!(!map.contains_key("engagementId"));
    }

    #[test]
    fn test_other_wraps_non_objects() {
        let meta = AuditMetadata::other("export.started", json!(5));
        assert_eq!(meta.action(), "export.started");
        assert_eq!(meta.to_map().unwrap().get("value"), Some(&json!(5)));
        assert!(AuditMetadata::other("x", Value::Null)
            .to_map()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_summary_for_known_actions() {
        assert_eq!(
            format_audit_summary(
                "upload",
                "document",
                &json!({"fileName": "return.pdf", "versionNumber": 1})
            ),
            "Uploaded return.pdf"
        );
        assert_eq!(
            format_audit_summary(
                "upload",
                "document",
                &json!({"fileName": "return.pdf", "versionNumber": 3})
            ),
            "Uploaded version 3 of return.pdf"
        );
        assert_eq!(
            format_audit_summary(
                "status_change",
                "document",
                &json!({"from": "in_review", "to": "final"})
            ),
            "Changed document status from in_review to final"
        );
        assert_eq!(
            format_audit_summary("bulk_update", "document", &json!({"count": 3, "status": "final"})),
            "Set 3 documents to final"
        );
        assert_eq!(
            format_audit_summary(
                "permission_change",
                "engagement",
                &json!({"change": "assign", "targetUserId": "u9"})
            ),
            "Assigned u9 to engagement"
        );
        assert_eq!(
            format_audit_summary("auth.logout", "user", &json!({})),
            "Signed out"
        );
    }

    #[test]
    fn test_summary_is_total() {
        let odd_inputs = [
            json!(null),
            json!(42),
            json!("string"),
            json!([1, 2, 3]),
            json!({"fileName": 7, "versionNumber": "x"}),
            json!({"change": "sideways"}),
        ];
        for action in [
            "upload",
            "download",
            "status_change",
            "bulk_update",
            "permission_change",
            "auth.login",
            "client.create",
            "document.delete",
            "",
            "something.new",
        ] {
            for meta in &odd_inputs {
                let summary = format_audit_summary(action, "thing", meta);
                assert!(!summary.is_empty());
            }
        }
        assert_eq!(
            format_audit_summary("something.new", "widget", &json!({})),
            "something.new on widget"
        );
        assert_eq!(
            format_audit_summary("permission_change", "client", &json!({"change": "sideways"})),
            "permission_change on client"
        );
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("=SUM(A1)"), "'=SUM(A1)");
        assert_eq!(csv_line(["a".to_string(), "b c".to_string()]), "a,b c\r\n");
    }

    #[test]
    fn test_staff_scope() {
        let staff = AuthUser {
            id: "s1".into(),
            firm_id: "f1".into(),
            email: "s@example.com".into(),
            name: "S".into(),
            role: crate::policy::Role::Staff,
            firm_name: "F".into(),
        };
        let scoped = scope_query(&staff, &AuditQuery::default()).unwrap();
        assert_eq!(scoped.user_id.as_deref(), Some("s1"));

        let other = AuditQuery {
            user_id: Some("s2".into()),
            ..Default::default()
        };
        assert!(matches!(
            scope_query(&staff, &other),
            Err(DocError::Forbidden)
        ));

        let mut admin = staff.clone();
        admin.role = crate::policy::Role::Admin;
        let scoped = scope_query(&admin, &other).unwrap();
        assert_eq!(scoped.user_id.as_deref(), Some("s2"));
    }
}
