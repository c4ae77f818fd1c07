use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::DocError;
use crate::storage;

type HmacSha256 = Hmac<Sha256>;

/// Object storage for document bytes. Keys are slash-separated and relative.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_object(
        &self,
        key: &str,
        body: &[u8],
        content_type: &str,
        size: u64,
    ) -> Result<(), DocError>;

    async fn delete_object(&self, key: &str) -> Result<(), DocError>;

    /// Time-limited URL that lets the holder fetch `key` without a session.
    async fn signed_download_url(&self, key: &str, ttl_secs: i64) -> Result<String, DocError>;
}

/// Filesystem-backed store. Download links point at this service's
/// `/blobs/{key}` route and carry an HMAC-SHA256 signature over the key and
/// expiry.
#[derive(Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    secret: String,
    base_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, secret: &str, base_url: &str) -> Self {
        Self {
            root: root.into(),
            secret: secret.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, DocError> {
        if key.is_empty() || key.contains('\\') {
            return Err(DocError::BadRequest(format!("invalid blob key `{key}`")));
        }
        let relative = Path::new(key);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(DocError::BadRequest(format!("invalid blob key `{key}`")));
        }
        Ok(self.root.join(relative))
    }

    fn sign(&self, key: &str, expires: i64) -> Result<String, DocError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| DocError::DownloadUrlGenerationFailed(e.to_string()))?;
        mac.update(format!("{key}\n{expires}").as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Checks a `/blobs` request. Expired links and bad signatures both fail.
    pub fn verify_signature(&self, key: &str, expires: i64, signature: &str) -> bool {
        if storage::now() > expires {
            return false;
        }
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            return false;
        };
        mac.update(format!("{key}\n{expires}").as_bytes());
        mac.verify_slice(&provided).is_ok()
    }

    pub async fn read_object(&self, key: &str) -> Result<Vec<u8>, DocError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DocError::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put_object(
        &self,
        key: &str,
        body: &[u8],
        content_type: &str,
        size: u64,
    ) -> Result<(), DocError> {
        let path = self.path_for(key)?;
        if body.len() as u64 != size {
            return Err(DocError::UploadStorageFailed(format!(
                "declared size {size} does not match body length {}",
                body.len()
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DocError::UploadStorageFailed(e.to_string()))?;
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| DocError::UploadStorageFailed(e.to_string()))?;

        tracing::debug!(key, content_type, size, "blob stored");
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), DocError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn signed_download_url(&self, key: &str, ttl_secs: i64) -> Result<String, DocError> {
        if ttl_secs <= 0 {
            return Err(DocError::DownloadUrlGenerationFailed(
                "ttl must be positive".into(),
            ));
        }
        let expires = storage::now() + ttl_secs;
        let signature = self.sign(key, expires)?;
        let path = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");

        Ok(format!(
            "{}/blobs/{}?expires={}&signature={}",
            self.base_url, path, expires, signature
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> LocalBlobStore {
        LocalBlobStore::new(dir.path(), "test-secret", "http://localhost:8080/")
    }

    fn query_param<'a>(url: &'a str, name: &str) -> &'a str {
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix(&format!("{name}=")))
            .unwrap_or("")
    }

    #[tokio::test]
    async fn test_put_read_delete() {
        let dir = TempDir::new().unwrap();
        let blobs = store(&dir);
        let key = "firms/f/clients/c/engagements/e/documents/d/v1/a.pdf";

        blobs
            .put_object(key, b"hello", "application/pdf", 5)
            .await
            .unwrap();
        assert_eq!(blobs.read_object(key).await.unwrap(), b"hello");

        blobs.delete_object(key).await.unwrap();
        assert!(matches!(
            blobs.read_object(key).await,
            Err(DocError::NotFound)
        ));
        // deleting twice is fine
        blobs.delete_object(key).await.unwrap();
    }

    #[tokio::test]
    async fn test_size_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let result = store(&dir).put_object("a/b.txt", b"abc", "text/plain", 10).await;
        assert!(matches!(result, Err(DocError::UploadStorageFailed(_))));
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() {
        let dir = TempDir::new().unwrap();
        let blobs = store(&dir);
        for key in ["../etc/passwd", "/abs/path", "a/../../b", "", "a\\b"] {
            assert!(
                blobs.put_object(key, b"x", "text/plain", 1).await.is_err(),
                "{key} accepted"
            );
        }
    }

    #[tokio::test]
    async fn test_signed_url_verifies() {
        let dir = TempDir::new().unwrap();
        let blobs = store(&dir);
        let key = "firms/f/docs/my file.pdf";

        let url = blobs.signed_download_url(key, 300).await.unwrap();
        assert!(url.starts_with("http://localhost:8080/blobs/firms/f/docs/my%20file.pdf?"));

        let expires: i64 = query_param(&url, "expires").parse().unwrap();
        let signature = query_param(&url, "signature");
        assert!(blobs.verify_signature(key, expires, signature));

        assert!(!blobs.verify_signature("firms/f/docs/other.pdf", expires, signature));
        assert!(!blobs.verify_signature(key, expires + 1, signature));
        assert!(!blobs.verify_signature(key, expires, "zz"));

        let other = LocalBlobStore::new(dir.path(), "other-secret", "http://localhost:8080");
        assert!(!other.verify_signature(key, expires, signature));
    }

    #[tokio::test]
    async fn test_expired_signature_rejected() {
        let dir = TempDir::new().unwrap();
        let blobs = store(&dir);
        let expires = storage::now() - 1;
        let signature = blobs.sign("k", expires).unwrap();
        assert!(!blobs.verify_signature("k", expires, &signature));
    }

    #[tokio::test]
    async fn test_non_positive_ttl() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            store(&dir).signed_download_url("k", 0).await,
            Err(DocError::DownloadUrlGenerationFailed(_))
        ));
    }
}
