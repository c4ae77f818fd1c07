//! HTTP surface. Handlers stay thin: they resolve the caller and the request
//! context, then delegate to the service modules, which own authorization
//! and auditing.
use crate::assignments;
use crate::audit::{self, AuditMetadata, AuditQuery, LoginMeta, RequestContext};
use crate::blob::{BlobStore, LocalBlobStore};
use crate::clients::{self, ClientUpdate, EngagementUpdate, NewClient, NewEngagement};
use crate::documents::{DocumentQuery, DocumentService, DocumentStatus, NewDocument, UploadedFile};
use crate::entities::document_version;
use crate::errors::DocError;
use crate::policy::{self, AuthUser};
use crate::rate_limit;
use crate::session::{self, SessionCookie};
use crate::settings::Settings;
use crate::storage::{self, NewUser};
use axum::body::Body;
use axum::extract::multipart::MultipartError;
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Multipart framing allowance on top of the configured file size limit.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub documents: DocumentService,
    /// Backs the `/blobs` route that signed download links point at.
    pub local_blobs: LocalBlobStore,
}

impl AppState {
    pub fn new(settings: Settings, db: DatabaseConnection) -> Self {
        let local_blobs = LocalBlobStore::new(
            settings.storage.root_dir.clone(),
            &settings.storage.signing_secret,
            &settings.public_base_url(),
        );
        let blobs: Arc<dyn BlobStore> = Arc::new(local_blobs.clone());
        Self::with_blob_store(settings, db, blobs, local_blobs)
    }

    pub fn with_blob_store(
        settings: Settings,
        db: DatabaseConnection,
        blobs: Arc<dyn BlobStore>,
        local_blobs: LocalBlobStore,
    ) -> Self {
        let documents = DocumentService::new(
            db.clone(),
            blobs,
            settings.uploads.clone(),
            settings.storage.signed_url_ttl_secs,
        );
        Self {
            settings: Arc::new(settings),
            db,
            documents,
            local_blobs,
        }
    }
}

/// The authenticated caller; rejects with `UNAUTHORIZED`.
pub struct CurrentUser(pub AuthUser);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = DocError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        session::require_user(&state.db, &parts.headers)
            .await
            .map(CurrentUser)
    }
}

/// Client address and user agent, for audit metadata and rate limit keys.
pub struct RequestMeta(pub RequestContext);

/// Forwarding headers are client-controlled unless a proxy in front of us
/// rewrites them, so they only count when `server.trust_forwarded_headers`
/// is set. Otherwise the socket peer address is used.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded: bool,
) -> Option<String> {
    fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    let forwarded = if trust_forwarded {
        header_str(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .or_else(|| header_str(headers, "x-real-ip"))
            .map(String::from)
    } else {
        None
    };
    forwarded.or_else(|| peer.map(|addr| addr.ip().to_string()))
}

impl FromRequestParts<AppState> for RequestMeta {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let ip_address = client_ip(
            &parts.headers,
            peer,
            state.settings.server.trust_forwarded_headers,
        );
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(String::from);

        Ok(RequestMeta(RequestContext {
            ip_address,
            user_agent,
        }))
    }
}

// Security headers middleware
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("no-store"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );

    response
}

pub fn router(state: AppState) -> Router {
    let upload_limit = DefaultBodyLimit::max(
        state.settings.uploads.max_upload_bytes as usize + MULTIPART_OVERHEAD_BYTES,
    );

    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/api/me", get(me))
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/users/{id}/assignments", get(user_assignments))
        .route("/api/clients", get(list_clients).post(create_client))
        .route("/api/clients/{id}", get(get_client).patch(update_client))
        .route(
            "/api/clients/{id}/assignments/{user_id}",
            post(assign_client).delete(unassign_client),
        )
        .route("/api/engagements", get(list_engagements).post(create_engagement))
        .route(
            "/api/engagements/{id}",
            get(get_engagement).patch(update_engagement),
        )
        .route(
            "/api/engagements/{id}/assignments/{user_id}",
            post(assign_engagement).delete(unassign_engagement),
        )
        .route(
            "/api/documents",
            get(list_documents)
                .post(upload_document)
                .layer(upload_limit.clone()),
        )
        .route("/api/documents/bulk-status", post(bulk_status))
        .route(
            "/api/documents/{id}",
            get(get_document).delete(delete_document),
        )
        .route(
            "/api/documents/{id}/versions",
            post(upload_version).layer(upload_limit),
        )
        .route("/api/documents/{id}/status", post(update_status))
        .route(
            "/api/documents/{id}/versions/{n}/download",
            post(signed_download),
        )
        .route("/api/audit", get(list_audit))
        .route("/api/audit/export", get(export_audit))
        .route("/blobs/{*key}", get(serve_blob))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(settings: Settings, db: DatabaseConnection) -> miette::Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .into_diagnostic()?;
    let state = AppState::new(settings, db);
    let router = router(state);

    tracing::info!("docvault listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .into_diagnostic()?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// Authentication

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    RequestMeta(ctx): RequestMeta,
    Json(req): Json<LoginRequest>,
) -> Result<Response, DocError> {
    let limits = &state.settings.rate_limit;
    if let Some(ip) = &ctx.ip_address {
        rate_limit::check_and_increment(
            &state.db,
            &rate_limit::login_ip_key(ip),
            limits.login_limit,
            limits.login_window_secs,
        )
        .await?;
    }
    rate_limit::check_and_increment(
        &state.db,
        &rate_limit::login_email_key(&req.email),
        limits.login_limit,
        limits.login_window_secs,
    )
    .await?;

    let user = match storage::verify_user_password(&state.db, &req.email, &req.password).await? {
        Some(user) => user,
        None => {
            tracing::info!(ip = ?ctx.ip_address, "login failed");
            return Err(DocError::Unauthorized);
        }
    };

    let txn = state.db.begin().await?;
    storage::record_login(&txn, &user.id).await?;
    let session = storage::create_session(&txn, &user, state.settings.session.ttl_secs).await?;
    audit::log_audit_event(
        &txn,
        &user.firm_id,
        &user.id,
        "user",
        &user.id,
        &AuditMetadata::Login(LoginMeta {
            email: user.email.clone(),
        }),
        Some(&ctx),
    )
    .await?;
    txn.commit().await?;

    let me = storage::resolve_session(&state.db, &session.id)
        .await?
        .ok_or(DocError::Unauthorized)?;
    let cookie = SessionCookie::new(session.id).to_cookie_header(&state.settings);

    tracing::info!(user_id = %me.id, firm_id = %me.firm_id, "login succeeded");
    Ok(([(header::SET_COOKIE, cookie)], Json(me)).into_response())
}

async fn logout(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    headers: HeaderMap,
) -> Result<Response, DocError> {
    let txn = state.db.begin().await?;
    if let Some(cookie) = SessionCookie::from_headers(&headers) {
        storage::delete_session(&txn, &cookie.session_id).await?;
    }
    audit::log_audit_event(
        &txn,
        &user.firm_id,
        &user.id,
        "user",
        &user.id,
        &AuditMetadata::Logout,
        Some(&ctx),
    )
    .await?;
    txn.commit().await?;

    Ok((
        StatusCode::NO_CONTENT,
        [(header::SET_COOKIE, SessionCookie::delete_cookie_header())],
    )
        .into_response())
}

async fn me(CurrentUser(user): CurrentUser) -> Json<AuthUser> {
    Json(user)
}

// Users

async fn list_users(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, DocError> {
    policy::ensure_role(policy::can_manage_assignments(user.role))?;
    let users = assignments::list_users_for_firm(&state.db, &user.firm_id).await?;
    Ok(Json(users))
}

async fn create_user(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    Json(input): Json<NewUser>,
) -> Result<impl IntoResponse, DocError> {
    policy::ensure_role(policy::can_manage_users(user.role))?;

    let txn = state.db.begin().await?;
    let created = storage::create_user(&txn, &user.firm_id, input).await?;
    audit::log_audit_event(
        &txn,
        &user.firm_id,
        &user.id,
        "user",
        &created.id,
        &AuditMetadata::other(
            "user.create",
            json!({ "targetUserId": created.id, "email": created.email, "role": created.role }),
        ),
        Some(&ctx),
    )
    .await?;
    txn.commit().await?;

    Ok((StatusCode::CREATED, Json(created)))
}

async fn user_assignments(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, DocError> {
    policy::ensure_role(policy::can_manage_assignments(user.role))?;
    let grants = assignments::get_user_assignments(&state.db, &user.firm_id, &id).await?;
    Ok(Json(grants))
}

// Clients and engagements

async fn list_clients(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, DocError> {
    Ok(Json(clients::list_visible_clients(&state.db, &user).await?))
}

async fn create_client(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    Json(input): Json<NewClient>,
) -> Result<impl IntoResponse, DocError> {
    let client = clients::create_client(&state.db, &user, input, Some(&ctx)).await?;
    Ok((StatusCode::CREATED, Json(client)))
}

async fn get_client(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, DocError> {
    Ok(Json(clients::get_client(&state.db, &user, &id).await?))
}

async fn update_client(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    Path(id): Path<String>,
    Json(update): Json<ClientUpdate>,
) -> Result<impl IntoResponse, DocError> {
    Ok(Json(
        clients::update_client(&state.db, &user, &id, update, Some(&ctx)).await?,
    ))
}

async fn assign_client(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    Path((id, user_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, DocError> {
    let grant = assignments::assign_client(&state.db, &user, &id, &user_id, Some(&ctx)).await?;
    Ok(Json(grant))
}

async fn unassign_client(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    Path((id, user_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, DocError> {
    let removed =
        assignments::unassign_client(&state.db, &user, &id, &user_id, Some(&ctx)).await?;
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Debug, Deserialize)]
struct EngagementListQuery {
    client_id: Option<String>,
}

async fn list_engagements(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<EngagementListQuery>,
) -> Result<impl IntoResponse, DocError> {
    let engagements =
        clients::list_visible_engagements(&state.db, &user, query.client_id.as_deref()).await?;
    Ok(Json(engagements))
}

async fn create_engagement(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    Json(input): Json<NewEngagement>,
) -> Result<impl IntoResponse, DocError> {
    let engagement = clients::create_engagement(&state.db, &user, input, Some(&ctx)).await?;
    Ok((StatusCode::CREATED, Json(engagement)))
}

async fn get_engagement(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, DocError> {
    Ok(Json(clients::get_engagement(&state.db, &user, &id).await?))
}

async fn update_engagement(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    Path(id): Path<String>,
    Json(update): Json<EngagementUpdate>,
) -> Result<impl IntoResponse, DocError> {
    Ok(Json(
        clients::update_engagement(&state.db, &user, &id, update, Some(&ctx)).await?,
    ))
}

async fn assign_engagement(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    Path((id, user_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, DocError> {
    let grant =
        assignments::assign_engagement(&state.db, &user, &id, &user_id, Some(&ctx)).await?;
    Ok(Json(grant))
}

async fn unassign_engagement(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    Path((id, user_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, DocError> {
    let removed =
        assignments::unassign_engagement(&state.db, &user, &id, &user_id, Some(&ctx)).await?;
    Ok(Json(json!({ "removed": removed })))
}

// Documents

fn multipart_error(e: MultipartError, max: u64) -> DocError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        DocError::FileTooLarge {
            size: max + MULTIPART_OVERHEAD_BYTES as u64,
            max,
        }
    } else {
        DocError::BadRequest(e.body_text())
    }
}

/// Text fields plus the single `file` part of an upload form.
async fn read_upload_form(
    mut multipart: Multipart,
    max: u64,
) -> Result<(HashMap<String, String>, UploadedFile), DocError> {
    let mut fields = HashMap::new();
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, max))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let mime_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let bytes = field.bytes().await.map_err(|e| multipart_error(e, max))?;
            file = Some(UploadedFile {
                file_name,
                mime_type,
                bytes: bytes.to_vec(),
            });
        } else {
            let value = field.text().await.map_err(|e| multipart_error(e, max))?;
            fields.insert(name, value);
        }
    }

    let file = file.ok_or_else(|| DocError::BadRequest("missing `file` part".into()))?;
    Ok((fields, file))
}

fn required_field(fields: &mut HashMap<String, String>, name: &str) -> Result<String, DocError> {
    fields
        .remove(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DocError::BadRequest(format!("missing `{name}` field")))
}

async fn check_upload_rate(state: &AppState, user: &AuthUser) -> Result<(), DocError> {
    let limits = &state.settings.rate_limit;
    rate_limit::check_and_increment(
        &state.db,
        &rate_limit::upload_user_key(&user.id),
        limits.upload_limit,
        limits.upload_window_secs,
    )
    .await
}

async fn list_documents(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<DocumentQuery>,
) -> Result<impl IntoResponse, DocError> {
    Ok(Json(state.documents.list_documents(&user, &query).await?))
}

async fn upload_document(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    multipart: Multipart,
) -> Result<impl IntoResponse, DocError> {
    check_upload_rate(&state, &user).await?;
    let (mut fields, file) =
        read_upload_form(multipart, state.settings.uploads.max_upload_bytes).await?;

    let input = NewDocument {
        client_id: required_field(&mut fields, "client_id")?,
        engagement_id: required_field(&mut fields, "engagement_id")?,
        document_type: required_field(&mut fields, "document_type")?,
        title: fields.remove("title"),
        file,
    };
    let created = state
        .documents
        .create_document_with_initial_version(&user, input, Some(&ctx))
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn upload_version(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<impl IntoResponse, DocError> {
    check_upload_rate(&state, &user).await?;
    let (_, file) = read_upload_form(multipart, state.settings.uploads.max_upload_bytes).await?;
    let created = state
        .documents
        .create_document_replacement_version(&user, &id, file, Some(&ctx))
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_document(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, DocError> {
    Ok(Json(state.documents.get_document(&user, &id).await?))
}

async fn delete_document(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, DocError> {
    state
        .documents
        .delete_document(&user, &id, Some(&ctx))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: DocumentStatus,
}

async fn update_status(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    Path(id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> Result<impl IntoResponse, DocError> {
    let document = state
        .documents
        .update_document_status(&user, &id, req.status, Some(&ctx))
        .await?;
    Ok(Json(document))
}

#[derive(Debug, Deserialize)]
struct BulkStatusRequest {
    #[serde(default)]
    document_ids: Vec<String>,
    status: DocumentStatus,
}

async fn bulk_status(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    Json(req): Json<BulkStatusRequest>,
) -> Result<impl IntoResponse, DocError> {
    let result = state
        .documents
        .bulk_update_document_status(&user, &req.document_ids, req.status, Some(&ctx))
        .await?;
    Ok(Json(result))
}

async fn signed_download(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    RequestMeta(ctx): RequestMeta,
    Path((id, n)): Path<(String, i32)>,
) -> Result<impl IntoResponse, DocError> {
    let link = state
        .documents
        .create_signed_download_for_version(&user, &id, n, Some(&ctx))
        .await?;
    Ok(Json(link))
}

// Audit

async fn list_audit(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, DocError> {
    Ok(Json(audit::list_audit_events(&state.db, &user, &query).await?))
}

async fn export_audit(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<AuditQuery>,
) -> Result<Response, DocError> {
    let export = audit::export_audit_events_csv(
        &state.db,
        &user,
        &query,
        state.settings.audit.csv_max_rows,
    )
    .await?;

    let mut response = (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"audit-export.csv\"",
            ),
        ],
        export.csv,
    )
        .into_response();
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-docvault-truncated"),
        HeaderValue::from_static(if export.truncated { "true" } else { "false" }),
    );
    headers.insert(
        HeaderName::from_static("x-docvault-row-count"),
        HeaderValue::from(export.row_count),
    );
    Ok(response)
}

// Signed blob downloads

#[derive(Debug, Deserialize)]
struct BlobQuery {
    expires: i64,
    signature: String,
}

async fn serve_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<BlobQuery>,
) -> Result<Response, DocError> {
    let key = key.trim_start_matches('/');
    if !state.local_blobs.verify_signature(key, q.expires, &q.signature) {
        return Err(DocError::Forbidden);
    }

    let version = document_version::Entity::find()
        .filter(document_version::Column::StorageKey.eq(key))
        .one(&state.db)
        .await?;
    let bytes = state.local_blobs.read_object(key).await?;

    let content_type = version
        .as_ref()
        .map(|v| v.mime_type.clone())
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let file_name = version
        .map(|v| v.file_name)
        .unwrap_or_else(|| key.rsplit('/').next().unwrap_or("download").to_string());
    let disposition = format!(
        "attachment; filename*=UTF-8''{}",
        urlencoding::encode(&file_name)
    );

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_forwarded_headers_ignored_by_default() {
        let peer: SocketAddr = "192.0.2.10:51000".parse().unwrap();
        let spoofed = headers(&[
            ("x-forwarded-for", "198.51.100.4, 10.0.0.1"),
            ("x-real-ip", "198.51.100.5"),
        ]);

        assert_eq!(
            client_ip(&spoofed, Some(peer), false).as_deref(),
            Some("192.0.2.10")
        );
        assert_eq!(client_ip(&spoofed, None, false), None);
    }

    #[test]
    fn test_forwarded_headers_behind_proxy() {
        let peer: SocketAddr = "10.0.0.1:443".parse().unwrap();

        let forwarded = headers(&[("x-forwarded-for", " 198.51.100.4 , 10.0.0.1")]);
        assert_eq!(
            client_ip(&forwarded, Some(peer), true).as_deref(),
            Some("198.51.100.4")
        );

        let real_ip = headers(&[("x-real-ip", "198.51.100.5")]);
        assert_eq!(
            client_ip(&real_ip, Some(peer), true).as_deref(),
            Some("198.51.100.5")
        );

        // Nothing forwarded: fall back to the peer
        assert_eq!(
            client_ip(&HeaderMap::new(), Some(peer), true).as_deref(),
            Some("10.0.0.1")
        );
    }
}
