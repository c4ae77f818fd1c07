use crate::errors::DocError;
use crate::policy::AuthUser;
use crate::settings::Settings;
use crate::storage;
use axum::http::HeaderMap;
use sea_orm::ConnectionTrait;

pub const SESSION_COOKIE_NAME: &str = "docvault_session";

#[derive(Clone, Debug)]
pub struct SessionCookie {
    pub session_id: String,
}

impl SessionCookie {
    pub fn new(session_id: String) -> Self {
        Self { session_id }
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let cookie_header = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;

        cookie_header.split(';').find_map(|cookie| {
            cookie
                .trim()
                .strip_prefix(SESSION_COOKIE_NAME)
                .and_then(|s| s.strip_prefix('='))
                .filter(|v| !v.is_empty())
                .map(|v| Self {
                    session_id: v.to_string(),
                })
        })
    }

    pub fn to_cookie_header(&self, settings: &Settings) -> String {
        let secure = settings.public_base_url().starts_with("https://");

        format!(
            "{}={}; HttpOnly; {}SameSite=Lax; Path=/; Max-Age={}",
            SESSION_COOKIE_NAME,
            self.session_id,
            if secure { "Secure; " } else { "" },
            settings.session.ttl_secs
        )
    }

    pub fn delete_cookie_header() -> String {
        format!(
            "{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0",
            SESSION_COOKIE_NAME
        )
    }
}

/// Resolves the caller from the session cookie or fails with `Unauthorized`.
pub async fn require_user<C: ConnectionTrait>(
    db: &C,
    headers: &HeaderMap,
) -> Result<AuthUser, DocError> {
    let cookie = SessionCookie::from_headers(headers).ok_or(DocError::Unauthorized)?;
    storage::resolve_session(db, &cookie.session_id)
        .await?
        .ok_or(DocError::Unauthorized)
}
