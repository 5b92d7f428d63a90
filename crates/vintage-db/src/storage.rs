//! Object storage for product image binaries.
//!
//! Each backend is bound to a single bucket (or directory) and addresses
//! objects by key. Deleting a missing key is not an error.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{primitives::ByteStream, Client as S3Client};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// An object read back from storage together with its recorded content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync + std::fmt::Debug {
    async fn put_object(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;
    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>>;
    async fn delete_object(&self, key: &str) -> Result<()>;
}

/// Stores objects as files below a root directory. The content type lives in
/// a `<file>.meta.json` sidecar next to each object.
#[derive(Debug, Clone)]
pub struct FsObjectStorage {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct ObjectMetadata {
    content_type: String,
    size: u64,
    stored_at: DateTime<Utc>,
}

impl FsObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || !relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
        {
            bail!("invalid object key '{key}'");
        }
        Ok(self.root.join(relative))
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".meta.json");
    PathBuf::from(raw)
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn put_object(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating storage directory {}", parent.display()))?;
        }

        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing object {}", path.display()))?;

        let metadata = ObjectMetadata {
            content_type: content_type.to_string(),
            size: bytes.len() as u64,
            stored_at: Utc::now(),
        };
        let encoded = serde_json::to_vec(&metadata).context("encoding object metadata")?;
        tokio::fs::write(sidecar_path(&path), encoded)
            .await
            .with_context(|| format!("writing metadata for {}", path.display()))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>> {
        let path = self.object_path(key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(anyhow!(err).context(format!("reading object {}", path.display())))
            }
        };

        let content_type = match tokio::fs::read(sidecar_path(&path)).await {
            Ok(raw) => serde_json::from_slice::<ObjectMetadata>(&raw)
                .map(|meta| meta.content_type)
                .unwrap_or_else(|_| FALLBACK_CONTENT_TYPE.to_string()),
            Err(_) => FALLBACK_CONTENT_TYPE.to_string(),
        };

        Ok(Some(StoredObject {
            bytes,
            content_type,
        }))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        for target in [sidecar_path(&path), path] {
            match tokio::fs::remove_file(&target).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(anyhow!(err).context(format!("deleting {}", target.display())))
                }
            }
        }
        Ok(())
    }
}

/// S3-compatible bucket (AWS, Cloudflare R2, MinIO).
#[derive(Debug, Clone)]
pub struct S3ObjectStorage {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStorage {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Builds a client from the ambient AWS configuration. A custom endpoint
    /// switches to path-style addressing, which R2 and MinIO expect.
    pub async fn from_env(bucket: impl Into<String>, endpoint: Option<&str>) -> Self {
        let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(S3Client::from_conf(builder.build()), bucket)
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    #[tracing::instrument(skip(self, bytes), fields(bucket = %self.bucket, size = bytes.len()))]
    async fn put_object(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(content_type)
            .send()
            .await
            .with_context(|| format!("uploading s3://{}/{key}", self.bucket))?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err)
                if err
                    .as_service_error()
                    .map(|service| service.is_no_such_key())
                    .unwrap_or(false) =>
            {
                return Ok(None)
            }
            Err(err) => {
                return Err(anyhow!(err).context(format!("fetching s3://{}/{key}", self.bucket)))
            }
        };

        let content_type = output
            .content_type()
            .unwrap_or(FALLBACK_CONTENT_TYPE)
            .to_string();
        let bytes = output
            .body
            .collect()
            .await
            .with_context(|| format!("reading body of s3://{}/{key}", self.bucket))?
            .into_bytes()
            .to_vec();

        Ok(Some(StoredObject {
            bytes,
            content_type,
        }))
    }

    #[tracing::instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("deleting s3://{}/{key}", self.bucket))?;
        Ok(())
    }
}

/// Process-local storage, used by tests and local development.
#[derive(Debug, Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<HashMap<String, StoredObject>>,
    fail_writes: AtomicBool,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `put_object` fail, to exercise error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put_object(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("object store unavailable");
        }
        self.objects.lock().insert(
            key.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>> {
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.objects.lock().remove(key);
        Ok(())
    }
}
