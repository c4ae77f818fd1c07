use async_trait::async_trait;
use docvault::blob::BlobStore;
use docvault::errors::DocError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobCall {
    Put { key: String, size: u64 },
    Delete { key: String },
    Sign { key: String, ttl_secs: i64 },
}

/// In-memory `BlobStore` that records every call and can be told to fail.
#[derive(Default)]
pub struct RecordingBlobStore {
    calls: Mutex<Vec<BlobCall>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_put: AtomicBool,
    fail_delete: AtomicBool,
    fail_sign: AtomicBool,
}

impl RecordingBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_put.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn fail_signing(&self, fail: bool) {
        self.fail_sign.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<BlobCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl BlobStore for RecordingBlobStore {
    async fn put_object(
        &self,
        key: &str,
        body: &[u8],
        _content_type: &str,
        size: u64,
    ) -> Result<(), DocError> {
        self.calls.lock().unwrap().push(BlobCall::Put {
            key: key.to_string(),
            size,
        });
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(DocError::UploadStorageFailed("injected put failure".into()));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), body.to_vec());
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), DocError> {
        self.calls.lock().unwrap().push(BlobCall::Delete {
            key: key.to_string(),
        });
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(DocError::Other("injected delete failure".into()));
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn signed_download_url(&self, key: &str, ttl_secs: i64) -> Result<String, DocError> {
        self.calls.lock().unwrap().push(BlobCall::Sign {
            key: key.to_string(),
            ttl_secs,
        });
        if self.fail_sign.load(Ordering::SeqCst) {
            return Err(DocError::DownloadUrlGenerationFailed(
                "injected signing failure".into(),
            ));
        }
        Ok(format!("memory://{key}?ttl={ttl_secs}"))
    }
}
