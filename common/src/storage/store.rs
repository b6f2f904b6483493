use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::memory::InMemory;
use object_store::path::Path as ObjPath;
use object_store::signer::Signer;
use object_store::ObjectStore;
use uuid::Uuid;

use crate::error::AppError;
use crate::utils::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

/// A presigned upload slot handed back to the client.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SignedUpload {
    pub url: String,
    pub content_type: String,
    pub expires_in: u64,
}

/// Gateway to the tenant-shared object store.
///
/// Keys are tenant-isolated; presigning is only available on the S3 backend
/// (the in-memory backend exists for tests and worker-side reads).
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
    signer: Option<Arc<AmazonS3>>,
    backend_kind: StorageKind,
}

/// Deterministic object key for one document version. Pure: same inputs,
/// same key.
pub fn generate_key(business_id: Uuid, document_id: Uuid, version_number: i32) -> String {
    format!("tenants/{business_id}/docs/{document_id}/v{version_number}/original")
}

impl StorageManager {
    pub fn new(cfg: &AppConfig) -> Result<Self, AppError> {
        match cfg.storage {
            StorageKind::S3 => {
                let missing =
                    || AppError::Validation("incomplete object store configuration".into());
                let s3 = AmazonS3Builder::new()
                    .with_endpoint(cfg.object_store_endpoint.clone().ok_or_else(missing)?)
                    .with_access_key_id(cfg.object_store_access_key.clone().ok_or_else(missing)?)
                    .with_secret_access_key(cfg.object_store_secret.clone().ok_or_else(missing)?)
                    .with_bucket_name(cfg.object_store_bucket.clone().ok_or_else(missing)?)
                    .with_allow_http(true)
                    .build()?;
                let s3 = Arc::new(s3);
                Ok(Self {
                    store: s3.clone(),
                    signer: Some(s3),
                    backend_kind: StorageKind::S3,
                })
            }
            StorageKind::Memory => Ok(Self::memory()),
        }
    }

    /// In-memory backend with no presigning, for tests.
    pub fn memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
            signer: None,
            backend_kind: StorageKind::Memory,
        }
    }

    pub fn backend_kind(&self) -> &StorageKind {
        &self.backend_kind
    }

    /// Time-limited PUT URL bound to the declared content type.
    pub async fn upload_url(
        &self,
        key: &str,
        content_type: &str,
        ttl_secs: u64,
    ) -> Result<SignedUpload, AppError> {
        let url = self
            .signed_url(Method::PUT, key, ttl_secs)
            .await?;
        Ok(SignedUpload {
            url,
            content_type: content_type.to_string(),
            expires_in: ttl_secs,
        })
    }

    /// Time-limited GET URL.
    pub async fn download_url(&self, key: &str, ttl_secs: u64) -> Result<String, AppError> {
        self.signed_url(Method::GET, key, ttl_secs).await
    }

    async fn signed_url(
        &self,
        method: Method,
        key: &str,
        ttl_secs: u64,
    ) -> Result<String, AppError> {
        match &self.signer {
            Some(signer) => {
                let url = signer
                    .signed_url(method, &ObjPath::from(key), Duration::from_secs(ttl_secs))
                    .await?;
                Ok(url.to_string())
            }
            // The in-memory backend cannot sign; hand back a recognizable
            // placeholder so the upload protocol stays exercisable in tests.
            None => Ok(format!("memory:///{key}")),
        }
    }

    /// Downloads the raw bytes for a key, fully buffered.
    pub async fn download(&self, key: &str) -> Result<Bytes, AppError> {
        let result = self.store.get(&ObjPath::from(key)).await?;
        Ok(result.bytes().await?)
    }

    pub async fn put(&self, key: &str, data: Bytes) -> Result<(), AppError> {
        self.store
            .put(&ObjPath::from(key), object_store::PutPayload::from_bytes(data))
            .await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, AppError> {
        match self.store.head(&ObjPath::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Terminal vs transient split for gateway failures: a missing object can
/// never succeed on retry, everything else may.
pub fn is_not_found(err: &AppError) -> bool {
    matches!(
        err,
        AppError::ObjectStore(object_store::Error::NotFound { .. }) | AppError::NotFound(_)
    )
}
