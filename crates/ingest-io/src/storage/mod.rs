//! Object storage adapters.
//!
//! - `ObjectStorage`: the blocking, bucket-addressed seam the engine drives.
//! - `cloud`: S3/GCS built on top of `object_store` (feature gated).
//! - `copy`: provider copy calls between buckets, which `object_store` lacks.
//! - `crate::memory_storage`: in-process implementation for tests.
//!
//! Also exposes `RetryConfig`, the `Backends` registry and `build_storage`, which
//! picks the backend for a provider.

#[cfg(any(feature = "s3", feature = "gcs"))]
mod cloud;
#[cfg(any(feature = "s3", feature = "gcs"))]
mod copy;
#[cfg(any(feature = "s3", feature = "gcs"))]
pub use cloud::{BucketHandle, CloudStorageBuilderError, ObjectStoreBackend};
#[cfg(any(feature = "s3", feature = "gcs"))]
pub use copy::ServerSideCopy;

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ingest_core::config::StorageConfig;
use ingest_core::location::{ObjectUri, Provider};

use crate::buf::{bounded_from_path, LOCAL_READ_CAPACITY};
use crate::error::{Error, Result};

/// Retry/backoff configuration shared across cloud adapters.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    pub fn from_storage_config(cfg: &StorageConfig) -> Self {
        Self {
            max_retries: cfg.retry_max_retries,
            initial_backoff: Duration::from_millis(cfg.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.retry_max_backoff_ms),
        }
    }
}

/// Provider metadata of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescription {
    pub size: u64,
    /// RFC 3339, UTC.
    pub last_modified: String,
    /// Entity tag without surrounding quotes.
    pub e_tag: Option<String>,
    /// Hex MD5 when the provider reports one.
    pub md5: Option<String>,
    pub crc32c: Option<u32>,
}

/// How uploads are cut into parts.
#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    /// Data that fits in one chunk is sent with a single put; larger data goes
    /// multipart in parts of exactly this size (last part shorter).
    pub chunk_size: usize,
    pub part_concurrency: usize,
}

/// Blocking, bucket-addressed object storage.
pub trait ObjectStorage: Send + Sync {
    fn provider(&self) -> Provider;

    fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Whether the current principal may create objects in `bucket`.
    /// `Err` means the answer could not be obtained.
    fn can_write(&self, bucket: &str) -> Result<bool>;

    /// `Ok(None)` when the object does not exist.
    fn describe(&self, bucket: &str, key: &str) -> Result<Option<ObjectDescription>>;

    /// First key under `prefix`, if any.
    fn first_under_prefix(&self, bucket: &str, prefix: &str) -> Result<Option<String>>;

    /// Upload everything `reader` yields; returns bytes written.
    fn upload(
        &self,
        bucket: &str,
        key: &str,
        reader: &mut dyn Read,
        opts: &UploadOptions,
    ) -> Result<u64>;

    fn open(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send + '_>>;

    /// Server-side copy into `dst_bucket`. `Error::Unsupported` when this
    /// backend cannot copy from `src`.
    fn copy_from(&self, src: &ObjectUri, dst_bucket: &str, dst_key: &str) -> Result<()>;

    fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    fn upload_file(&self, bucket: &str, key: &str, path: &Path, opts: &UploadOptions) -> Result<u64> {
        let mut reader = bounded_from_path(path, LOCAL_READ_CAPACITY)?;
        self.upload(bucket, key, &mut reader, opts)
    }

    fn download_to(&self, bucket: &str, key: &str, dest: &mut dyn Write) -> Result<u64> {
        let mut reader = self.open(bucket, key)?;
        Ok(std::io::copy(&mut reader, dest)?)
    }
}

/// One storage backend per provider.
#[derive(Clone, Default)]
pub struct Backends {
    aws: Option<Arc<dyn ObjectStorage>>,
    gcs: Option<Arc<dyn ObjectStorage>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `storage` under its own provider, replacing any previous one.
    pub fn with(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        match storage.provider() {
            Provider::Aws => self.aws = Some(storage),
            Provider::Gcs => self.gcs = Some(storage),
        }
        self
    }

    pub fn get(&self, provider: Provider) -> Result<&Arc<dyn ObjectStorage>> {
        let slot = match provider {
            Provider::Aws => &self.aws,
            Provider::Gcs => &self.gcs,
        };
        slot.as_ref()
            .ok_or_else(|| Error::Config(format!("no storage backend configured for {provider}")))
    }

    pub fn contains(&self, provider: Provider) -> bool {
        self.get(provider).is_ok()
    }
}

/// Build the correct storage backend using the provided configuration.
pub fn build_storage(cfg: &StorageConfig) -> Result<Arc<dyn ObjectStorage>> {
    if let Some(endpoint) = &cfg.aws_endpoint {
        url::Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint '{endpoint}': {e}")))?;
    }
    match cfg.provider {
        Provider::Aws => {
            #[cfg(feature = "s3")]
            {
                let storage = ObjectStoreBackend::new(cfg)?;
                Ok(Arc::new(storage))
            }

            #[cfg(not(feature = "s3"))]
            {
                Err(Error::Config(
                    "ingest was built without the `s3` feature; rebuild with `--features ingest-io/s3`"
                        .into(),
                ))
            }
        }
        Provider::Gcs => {
            #[cfg(feature = "gcs")]
            {
                let storage = ObjectStoreBackend::new(cfg)?;
                Ok(Arc::new(storage))
            }

            #[cfg(not(feature = "gcs"))]
            {
                Err(Error::Config(
                    "ingest was built without the `gcs` feature; rebuild with `--features ingest-io/gcs`"
                        .into(),
                ))
            }
        }
    }
}

/// Backends for every provider in `providers`, built from `cfg_for`.
pub fn build_backends<F>(providers: &[Provider], cfg_for: F) -> Result<Backends>
where
    F: Fn(Provider) -> StorageConfig,
{
    let mut backends = Backends::new();
    for provider in providers {
        if !backends.contains(*provider) {
            backends = backends.with(build_storage(&cfg_for(*provider))?);
        }
    }
    Ok(backends)
}
