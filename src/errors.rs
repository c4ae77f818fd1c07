use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum DocError {
    #[error("Authentication required")]
    #[diagnostic(code(docvault::unauthorized))]
    Unauthorized,

    #[error("Operation not permitted")]
    #[diagnostic(code(docvault::forbidden))]
    Forbidden,

    /// Absent, or present but invisible to the caller. The two are not distinguished.
    #[error("Resource not found")]
    #[diagnostic(code(docvault::not_found))]
    NotFound,

    #[error("Cannot move document from `{from}` to `{to}`")]
    #[diagnostic(
        code(docvault::invalid_status_transition),
        help("Documents move uploaded -> in_review -> final; only admins and managers may reopen a final document")
    )]
    InvalidStatusTransition { from: String, to: String },

    #[error("File is {size} bytes, the limit is {max} bytes")]
    #[diagnostic(code(docvault::file_too_large))]
    FileTooLarge { size: u64, max: u64 },

    #[error("MIME type `{0}` is not accepted")]
    #[diagnostic(code(docvault::unsupported_mime_type))]
    UnsupportedMimeType(String),

    #[error("Blob upload failed: {0}")]
    #[diagnostic(code(docvault::upload_storage_failed))]
    UploadStorageFailed(String),

    #[error("Could not generate download URL: {0}")]
    #[diagnostic(code(docvault::download_url_generation_failed))]
    DownloadUrlGenerationFailed(String),

    #[error("No documents given")]
    #[diagnostic(code(docvault::no_documents))]
    NoDocuments,

    #[error("Too many requests, retry in {retry_after_secs}s")]
    #[diagnostic(code(docvault::rate_limited))]
    RateLimited { retry_after_secs: i64 },

    #[error("Version {version_number} of document {document_id} was created concurrently")]
    #[diagnostic(code(docvault::version_conflict))]
    VersionConflict {
        document_id: String,
        version_number: i32,
    },

    #[error("Bad request: {0}")]
    #[diagnostic(code(docvault::bad_request))]
    BadRequest(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(docvault::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(docvault::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(docvault::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(docvault::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("{0}")]
    #[diagnostic(code(docvault::other))]
    Other(String),
}

impl DocError {
    /// Stable machine-readable code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            DocError::Unauthorized => "UNAUTHORIZED",
            DocError::Forbidden => "FORBIDDEN",
            DocError::NotFound => "NOT_FOUND",
            DocError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            DocError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            DocError::UnsupportedMimeType(_) => "UNSUPPORTED_MIME_TYPE",
            DocError::UploadStorageFailed(_) => "UPLOAD_STORAGE_FAILED",
            DocError::DownloadUrlGenerationFailed(_) => "DOWNLOAD_URL_GENERATION_FAILED",
            DocError::NoDocuments => "NO_DOCUMENTS",
            DocError::RateLimited { .. } => "RATE_LIMITED",
            DocError::VersionConflict { .. } => "VERSION_CONFLICT",
            DocError::BadRequest(_) => "BAD_REQUEST",
            DocError::Io(_)
            | DocError::Config(_)
            | DocError::Serde(_)
            | DocError::Db(_)
            | DocError::Other(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            DocError::Unauthorized => StatusCode::UNAUTHORIZED,
            DocError::Forbidden => StatusCode::FORBIDDEN,
            DocError::NotFound => StatusCode::NOT_FOUND,
            DocError::InvalidStatusTransition { .. } | DocError::VersionConflict { .. } => {
                StatusCode::CONFLICT
            }
            DocError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            DocError::UnsupportedMimeType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DocError::NoDocuments | DocError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DocError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            DocError::UploadStorageFailed(_) | DocError::DownloadUrlGenerationFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DocError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal failures are logged in full but never echoed to the caller
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            "Internal error".to_string()
        } else {
            self.to_string()
        };
        let body = json!({ "error": self.code(), "message": message });
        let mut response = (status, Json(body)).into_response();
        if let DocError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(DocError::NotFound.code(), "NOT_FOUND");
        assert_eq!(DocError::NoDocuments.code(), "NO_DOCUMENTS");
        assert_eq!(
            DocError::InvalidStatusTransition {
                from: "final".into(),
                to: "uploaded".into()
            }
            .code(),
            "INVALID_STATUS_TRANSITION"
        );
        assert_eq!(
            DocError::Other("boom".into()).code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = DocError::RateLimited {
            retry_after_secs: 42,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "42"
        );
    }

    #[test]
    fn test_internal_errors_hide_detail() {
        let response = DocError::Other("secret table name".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
