//! Blob store abstraction for rendered artifacts.
//!
//! The worker uploads one artifact per successful render and mints a
//! time-limited GET URL for it; nothing ever reads objects back through this
//! interface. The contract is therefore deliberately small:
//!
//! - [`BlobStore::upload`] stores bytes under a key
//! - [`BlobStore::presign_get`] issues a URL permitting unauthenticated GET
//!   for at most the given TTL
//!
//! [`S3BlobStore`] is the deployment backend; [`MemoryBlobStore`] backs
//! tests with a mock signed URL that embeds the expiry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::ObjectStore;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;

use crate::error::{Error, Result};

/// Capability trait for artifact storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `data` under `key`, replacing any existing object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on transport failures.
    async fn upload(&self, key: &str, data: Bytes) -> Result<()>;

    /// Issues a URL permitting unauthenticated GET of `key` for at most `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the URL cannot be signed.
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// S3-backed blob store.
///
/// Credentials and region come from the ambient AWS environment
/// (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_REGION`, …). A custom
/// endpoint switches to path-style addressing over plain HTTP for local
/// stacks.
#[derive(Debug)]
pub struct S3BlobStore {
    store: AmazonS3,
    bucket: String,
}

impl S3BlobStore {
    /// Builds a blob store for `bucket`, optionally against a custom endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the backend configuration is invalid.
    pub fn from_bucket(bucket: &str, endpoint_url: Option<&str>) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(endpoint) = endpoint_url {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(true)
                .with_virtual_hosted_style_request(false);
        }

        let store = builder
            .build()
            .map_err(|e| Error::storage_with_source("failed to build S3 backend", e))?;

        Ok(Self {
            store,
            bucket: bucket.to_string(),
        })
    }

    /// Returns the bucket this store writes to.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn upload(&self, key: &str, data: Bytes) -> Result<()> {
        self.store
            .put(&ObjectPath::from(key), data.into())
            .await
            .map_err(|e| Error::storage_with_source(format!("upload failed for {key}"), e))?;

        tracing::info!(bucket = %self.bucket, key = %key, "artifact uploaded");
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String> {
        let url = self
            .store
            .signed_url(http::Method::GET, &ObjectPath::from(key), ttl)
            .await
            .map_err(|e| Error::storage_with_source(format!("presign failed for {key}"), e))?;
        Ok(url.to_string())
    }
}

/// In-memory blob store for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored bytes for `key`, if present.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned (test-only helper).
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.read().expect("lock poisoned").get(key).cloned()
    }

    /// Returns every stored key.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned (test-only helper).
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Error::Internal {
                message: "blob store lock poisoned".to_string(),
            })?
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "blob store lock poisoned".to_string(),
        })?;

        if !objects.contains_key(key) {
            return Err(Error::storage(format!("object not found: {key}")));
        }
        Ok(format!(
            "memory://localhost/{key}?expires={}&signature=mock",
            ttl.as_secs()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_then_presign_round_trip() {
        let store = MemoryBlobStore::new();
        store
            .upload("manim_outputs/s1/123.mp4", Bytes::from("video bytes"))
            .await
            .expect("upload should succeed");

        assert_eq!(
            store.get("manim_outputs/s1/123.mp4"),
            Some(Bytes::from("video bytes"))
        );

        let url = store
            .presign_get("manim_outputs/s1/123.mp4", Duration::from_secs(180))
            .await
            .expect("presign should succeed");
        assert!(url.contains("manim_outputs/s1/123.mp4"));
        assert!(url.contains("expires=180"));
    }

    #[tokio::test]
    async fn presign_missing_object_fails() {
        let store = MemoryBlobStore::new();
        let err = store
            .presign_get("missing", Duration::from_secs(60))
            .await
            .expect_err("missing object must fail");
        assert!(matches!(err, Error::Storage { .. }));
    }
}
