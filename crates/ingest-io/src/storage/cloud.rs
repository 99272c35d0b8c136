use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use chrono::SecondsFormat;
use futures::StreamExt;
use ingest_core::config::StorageConfig;
use ingest_core::digest::is_plain_md5;
use ingest_core::location::{ObjectUri, Provider};
use object_store::path::Path as ObjectPath;
use object_store::{
    BackoffConfig, Error as ObjectStoreError, MultipartUpload, ObjectMeta, ObjectStore, PutPayload,
};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(feature = "s3")]
use object_store::aws::{AmazonS3Builder, AmazonS3ConfigKey};
#[cfg(feature = "gcs")]
use object_store::gcp::GoogleCloudStorageBuilder;

#[cfg(feature = "s3")]
use super::copy::S3CopyObject;
#[cfg(feature = "gcs")]
use super::copy::GcsRewrite;
use super::copy::ServerSideCopy;
use super::{ObjectDescription, ObjectStorage, RetryConfig, UploadOptions};
use crate::buf::read_chunk;
use crate::error::{Error, Result};

/// Providers reject multipart parts below this size (except the last).
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Bytes fetched per ranged GET when streaming an object.
const READ_AHEAD: usize = 8 * 1024 * 1024;

const PROBE_PREFIX: &str = ".ingest-write-probe";

#[derive(Debug, thiserror::Error)]
pub enum CloudStorageBuilderError {
    #[error("failed to initialize async runtime: {0}")]
    Runtime(String),

    #[error("object_store builder error: {0}")]
    Builder(String),
}

impl From<CloudStorageBuilderError> for Error {
    fn from(err: CloudStorageBuilderError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Store for one bucket plus the copier that writes into it from other buckets.
#[derive(Clone)]
pub struct BucketHandle {
    pub store: Arc<dyn ObjectStore>,
    pub copier: Option<Arc<dyn ServerSideCopy>>,
}

/// `object_store`-backed storage for one provider. Stores are built lazily per
/// bucket and share one runtime; every call runs under the configured deadline.
pub struct ObjectStoreBackend {
    provider: Provider,
    config: StorageConfig,
    runtime: Runtime,
    buckets: Mutex<HashMap<String, BucketHandle>>,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl ObjectStoreBackend {
    pub fn new(cfg: &StorageConfig) -> std::result::Result<Self, CloudStorageBuilderError> {
        let runtime =
            Runtime::new().map_err(|e| CloudStorageBuilderError::Runtime(e.to_string()))?;
        Ok(Self {
            provider: cfg.provider,
            config: cfg.clone(),
            runtime,
            buckets: Mutex::new(HashMap::new()),
            retry: RetryConfig::from_storage_config(cfg),
            call_timeout: Duration::from_millis(cfg.call_timeout_ms.max(1)),
        })
    }

    /// Use `handle` for `bucket` instead of building a store from the config.
    pub fn with_bucket(self, bucket: impl Into<String>, handle: BucketHandle) -> Self {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bucket.into(), handle);
        self
    }

    fn handle(&self, bucket: &str) -> Result<BucketHandle> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = buckets.get(bucket) {
            return Ok(handle.clone());
        }
        let handle = build_store(&self.config, bucket)?;
        buckets.insert(bucket.to_string(), handle.clone());
        Ok(handle)
    }

    fn store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        Ok(self.handle(bucket)?.store)
    }

    /// One call under the deadline, no retries.
    fn block<T>(&self, fut: impl Future<Output = object_store::Result<T>>) -> Result<T> {
        let timeout = self.call_timeout;
        self.runtime
            .block_on(async move { tokio::time::timeout(timeout, fut).await })
            .map_err(|_| Error::Timeout(timeout))?
            .map_err(map_err)
    }

    fn run_with_retry<F, Fut, T>(&self, mut op: F, retry_not_found: bool) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = object_store::Result<T>>,
    {
        let mut attempt = 0usize;
        let mut backoff = self.retry.initial_backoff;
        let timeout = self.call_timeout;

        loop {
            let result = self
                .runtime
                .block_on(async { tokio::time::timeout(timeout, op()).await });
            let err = match result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    let is_not_found = matches!(err, ObjectStoreError::NotFound { .. });
                    if is_not_found && !retry_not_found {
                        return Err(map_err(err));
                    }
                    if attempt >= self.retry.max_retries || !is_retryable(&err) {
                        return Err(map_err(err));
                    }
                    map_err(err)
                }
                Err(_) => {
                    if attempt >= self.retry.max_retries {
                        return Err(Error::Timeout(timeout));
                    }
                    Error::Timeout(timeout)
                }
            };
            attempt += 1;
            debug!(attempt, error = %err, "retrying provider call");
            thread::sleep(backoff);
            backoff = std::cmp::min(backoff * 2, self.retry.max_backoff);
        }
    }

    fn put_single(&self, store: &Arc<dyn ObjectStore>, path: &ObjectPath, data: Vec<u8>) -> Result<()> {
        let payload = PutPayload::from(Bytes::from(data));
        self.run_with_retry(
            || {
                let store = Arc::clone(store);
                let payload = payload.clone();
                async move { store.put(path, payload).await.map(|_| ()) }
            },
            true,
        )
    }

    /// Parts are read on the calling thread and sent by runtime tasks, so a
    /// reader that drives its own provider calls never runs inside `block_on`.
    fn send_parts(
        &self,
        upload: &mut dyn MultipartUpload,
        reader: &mut dyn Read,
        first: [Vec<u8>; 2],
        opts: &UploadOptions,
    ) -> Result<u64> {
        let limit = opts.part_concurrency.max(1);
        let timeout = self.call_timeout;
        let mut pending: VecDeque<Vec<u8>> = first.into_iter().collect();
        let mut inflight: VecDeque<JoinHandle<Result<()>>> = VecDeque::new();
        let mut total = 0u64;

        let outcome = loop {
            let part = match pending.pop_front() {
                Some(part) => part,
                None => match read_chunk(reader, opts.chunk_size) {
                    Ok(part) => part,
                    Err(e) => break Err(Error::from(e)),
                },
            };
            if part.is_empty() {
                break Ok(());
            }
            if inflight.len() >= limit {
                if let Some(oldest) = inflight.pop_front() {
                    if let Err(e) = self.join_part(oldest) {
                        break Err(e);
                    }
                }
            }
            total += part.len() as u64;
            let fut = upload.put_part(PutPayload::from(Bytes::from(part)));
            inflight.push_back(self.runtime.spawn(async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result.map_err(map_err),
                    Err(_) => Err(Error::Timeout(timeout)),
                }
            }));
        };

        match outcome {
            Ok(()) => {
                for handle in inflight {
                    self.join_part(handle)?;
                }
                Ok(total)
            }
            Err(e) => {
                for handle in inflight {
                    handle.abort();
                }
                Err(e)
            }
        }
    }

    fn join_part(&self, handle: JoinHandle<Result<()>>) -> Result<()> {
        self.runtime
            .block_on(handle)
            .map_err(|e| Error::Storage(format!("part upload task failed: {e}")))?
    }
}

fn is_retryable(err: &ObjectStoreError) -> bool {
    !matches!(
        err,
        ObjectStoreError::NotFound { .. }
            | ObjectStoreError::AlreadyExists { .. }
            | ObjectStoreError::Precondition { .. }
            | ObjectStoreError::NotSupported { .. }
            | ObjectStoreError::PermissionDenied { .. }
            | ObjectStoreError::Unauthenticated { .. }
            | ObjectStoreError::NotImplemented
    )
}

/// Listing a bucket that does not exist surfaces as a generic error on S3
/// (`NoSuchBucket`) and GCS (404 "bucket does not exist").
fn is_missing_bucket(err: &ObjectStoreError) -> bool {
    if matches!(err, ObjectStoreError::NotFound { .. }) {
        return true;
    }
    let mut current: Option<&dyn std::error::Error> = Some(err);
    while let Some(e) = current {
        let text = e.to_string();
        if text.contains("NoSuchBucket")
            || text.contains("bucket does not exist")
            || text.contains("404 Not Found")
        {
            return true;
        }
        current = e.source();
    }
    false
}

fn map_err(err: ObjectStoreError) -> Error {
    match &err {
        ObjectStoreError::NotFound { path, .. } => Error::NotFound(path.clone()),
        ObjectStoreError::NotSupported { .. } | ObjectStoreError::NotImplemented => {
            Error::Unsupported(err.to_string())
        }
        _ => Error::Storage(err.to_string()),
    }
}

fn describe_meta(provider: Provider, meta: &ObjectMeta) -> ObjectDescription {
    let e_tag = meta
        .e_tag
        .as_deref()
        .map(|t| t.trim_matches('"').to_string());
    // GCS entity tags of non-composite objects are the content MD5.
    let md5 = match provider {
        Provider::Gcs => e_tag.clone().filter(|t| is_plain_md5(t)),
        Provider::Aws => None,
    };
    ObjectDescription {
        size: meta.size as u64,
        last_modified: meta.last_modified.to_rfc3339_opts(SecondsFormat::Secs, true),
        e_tag,
        md5,
        crc32c: None,
    }
}

impl ObjectStorage for ObjectStoreBackend {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let store = self.store(bucket)?;
        let timeout = self.call_timeout;
        let listed = self.runtime.block_on(async move {
            tokio::time::timeout(timeout, async {
                match store.list(None).next().await {
                    None => Ok(()),
                    Some(item) => item.map(|_| ()),
                }
            })
            .await
        });
        match listed {
            Err(_) => Err(Error::Timeout(timeout)),
            Ok(Ok(())) => Ok(true),
            Ok(Err(err)) if is_missing_bucket(&err) => Ok(false),
            Ok(Err(err)) => Err(map_err(err)),
        }
    }

    // Permission test: create and remove a probe object.
    fn can_write(&self, bucket: &str) -> Result<bool> {
        let store = self.store(bucket)?;
        let probe = ObjectPath::from(format!("{PROBE_PREFIX}/{}", uuid::Uuid::new_v4()));
        let timeout = self.call_timeout;
        let result = self.runtime.block_on(async {
            tokio::time::timeout(timeout, store.put(&probe, PutPayload::from(Vec::<u8>::new())))
                .await
        });
        match result {
            Err(_) => Err(Error::Timeout(timeout)),
            Ok(Ok(_)) => {
                if let Err(e) = self.block(store.delete(&probe)) {
                    warn!(bucket, error = %e, "could not remove write probe");
                }
                Ok(true)
            }
            Ok(Err(
                ObjectStoreError::PermissionDenied { .. } | ObjectStoreError::Unauthenticated { .. },
            )) => Ok(false),
            Ok(Err(ObjectStoreError::NotFound { .. })) => Ok(false),
            Ok(Err(err)) => Err(map_err(err)),
        }
    }

    fn describe(&self, bucket: &str, key: &str) -> Result<Option<ObjectDescription>> {
        let store = self.store(bucket)?;
        let path = ObjectPath::from(key);
        let head = self.run_with_retry(
            || {
                let store = Arc::clone(&store);
                let path = path.clone();
                async move { store.head(&path).await }
            },
            false,
        );
        match head {
            Ok(meta) => Ok(Some(describe_meta(self.provider, &meta))),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn first_under_prefix(&self, bucket: &str, prefix: &str) -> Result<Option<String>> {
        let store = self.store(bucket)?;
        let prefix_path = ObjectPath::from(prefix.trim_end_matches('/'));
        let wanted = prefix.to_string();
        let timeout = self.call_timeout;
        self.runtime
            .block_on(async move {
                tokio::time::timeout(timeout, async {
                    let mut stream = store.list(Some(&prefix_path));
                    while let Some(item) = stream.next().await {
                        let location = item.map_err(map_err)?.location.to_string();
                        if location.starts_with(&wanted) {
                            return Ok(Some(location));
                        }
                    }
                    Ok(None)
                })
                .await
            })
            .map_err(|_| Error::Timeout(timeout))?
    }

    fn upload(
        &self,
        bucket: &str,
        key: &str,
        reader: &mut dyn Read,
        opts: &UploadOptions,
    ) -> Result<u64> {
        let store = self.store(bucket)?;
        let path = ObjectPath::from(key);
        let chunk = opts.chunk_size.max(1);

        let first = read_chunk(reader, chunk)?;
        let second = if first.len() == chunk {
            read_chunk(reader, chunk)?
        } else {
            Vec::new()
        };
        if second.is_empty() {
            let len = first.len() as u64;
            self.put_single(&store, &path, first)?;
            return Ok(len);
        }

        if chunk < MIN_PART_SIZE {
            return Err(Error::Config(format!(
                "chunk size {chunk} is below the {MIN_PART_SIZE}-byte multipart minimum"
            )));
        }
        let mut upload = self.block(store.put_multipart(&path))?;
        match self.send_parts(upload.as_mut(), reader, [first, second], opts) {
            Ok(total) => {
                self.block(upload.complete())?;
                Ok(total)
            }
            Err(e) => {
                if let Err(abort) = self.block(upload.abort()) {
                    warn!(key, error = %abort, "failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    fn open(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send + '_>> {
        let store = self.store(bucket)?;
        let path = ObjectPath::from(key);
        let meta = self.run_with_retry(
            || {
                let store = Arc::clone(&store);
                let path = path.clone();
                async move { store.head(&path).await }
            },
            false,
        )?;
        Ok(Box::new(RangeReader {
            backend: self,
            store,
            path,
            size: meta.size,
            offset: 0,
            buffer: Bytes::new(),
        }))
    }

    fn copy_from(&self, src: &ObjectUri, dst_bucket: &str, dst_key: &str) -> Result<()> {
        let unsupported = || {
            Error::Unsupported(format!(
                "server-side copy from {src} into {}://{dst_bucket}",
                self.provider
            ))
        };
        if src.provider != self.provider {
            return Err(unsupported());
        }
        let handle = self.handle(dst_bucket)?;
        if src.bucket == dst_bucket {
            let store = handle.store;
            let from = ObjectPath::from(src.key.as_str());
            let to = ObjectPath::from(dst_key);
            return self.run_with_retry(
                || {
                    let store = Arc::clone(&store);
                    let (from, to) = (from.clone(), to.clone());
                    async move { store.copy(&from, &to).await }
                },
                false,
            );
        }
        let copier = handle.copier.ok_or_else(unsupported)?;
        self.run_with_retry(|| copier.copy(src, dst_bucket, dst_key), false)
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let store = self.store(bucket)?;
        let path = ObjectPath::from(key);
        match self.run_with_retry(
            || {
                let store = Arc::clone(&store);
                let path = path.clone();
                async move { store.delete(&path).await }
            },
            false,
        ) {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Sequential reader over ranged GETs.
struct RangeReader<'a> {
    backend: &'a ObjectStoreBackend,
    store: Arc<dyn ObjectStore>,
    path: ObjectPath,
    size: usize,
    offset: usize,
    buffer: Bytes,
}

impl Read for RangeReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffer.is_empty() {
            if self.offset >= self.size || buf.is_empty() {
                return Ok(0);
            }
            let range = self.offset..(self.offset + READ_AHEAD).min(self.size);
            let store = &self.store;
            let path = &self.path;
            let bytes = self
                .backend
                .run_with_retry(
                    || {
                        let store = Arc::clone(store);
                        let path = path.clone();
                        let range = range.clone();
                        async move { store.get_range(&path, range).await }
                    },
                    false,
                )
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            if bytes.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} ended early at byte {}", self.path, self.offset),
                ));
            }
            self.offset += bytes.len();
            self.buffer = bytes;
        }
        let n = buf.len().min(self.buffer.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer = self.buffer.slice(n..);
        Ok(n)
    }
}

fn object_store_retry(retry: &RetryConfig) -> object_store::RetryConfig {
    object_store::RetryConfig {
        max_retries: retry.max_retries,
        retry_timeout: retry.max_backoff * (retry.max_retries as u32 + 1),
        backoff: BackoffConfig {
            init_backoff: retry.initial_backoff,
            max_backoff: retry.max_backoff,
            base: 2.0,
        },
    }
}

fn build_store(
    cfg: &StorageConfig,
    bucket: &str,
) -> std::result::Result<BucketHandle, CloudStorageBuilderError> {
    let retry = object_store_retry(&RetryConfig::from_storage_config(cfg));
    match cfg.provider {
        Provider::Aws => {
            #[cfg(feature = "s3")]
            {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_retry(retry);
                if let Some(region) = &cfg.aws_region {
                    builder = builder.with_region(region.clone());
                }
                if let Some(access_key) = &cfg.aws_access_key_id {
                    builder = builder.with_access_key_id(access_key.clone());
                }
                if let Some(secret_key) = &cfg.aws_secret_access_key {
                    builder = builder.with_secret_access_key(secret_key.clone());
                }
                if let Some(token) = &cfg.aws_session_token {
                    builder = builder.with_token(token.clone());
                }
                if let Some(endpoint) = &cfg.aws_endpoint {
                    builder = builder
                        .with_endpoint(endpoint.clone())
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                let region = builder
                    .get_config_value(&AmazonS3ConfigKey::Region)
                    .unwrap_or_else(|| "us-east-1".to_string());
                let endpoint = builder.get_config_value(&AmazonS3ConfigKey::Endpoint);
                let store = builder
                    .build()
                    .map_err(|e| CloudStorageBuilderError::Builder(e.to_string()))?;
                let copier = S3CopyObject::new(Arc::clone(store.credentials()), region, endpoint)
                    .map_err(|e| CloudStorageBuilderError::Builder(e.to_string()))?;
                Ok(BucketHandle {
                    store: Arc::new(store),
                    copier: Some(Arc::new(copier)),
                })
            }

            #[cfg(not(feature = "s3"))]
            {
                let _ = (bucket, retry);
                Err(CloudStorageBuilderError::Builder(
                    "built without the `s3` feature".into(),
                ))
            }
        }
        Provider::Gcs => {
            #[cfg(feature = "gcs")]
            {
                let mut builder = GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket)
                    .with_retry(retry);
                if let Some(sa_path) = &cfg.gcs_service_account_path {
                    builder = builder.with_service_account_path(sa_path);
                }
                let store = builder
                    .build()
                    .map_err(|e| CloudStorageBuilderError::Builder(e.to_string()))?;
                let copier = GcsRewrite::new(Arc::clone(store.credentials()))
                    .map_err(|e| CloudStorageBuilderError::Builder(e.to_string()))?;
                Ok(BucketHandle {
                    store: Arc::new(store),
                    copier: Some(Arc::new(copier)),
                })
            }

            #[cfg(not(feature = "gcs"))]
            {
                let _ = (bucket, retry);
                Err(CloudStorageBuilderError::Builder(
                    "built without the `gcs` feature".into(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use chrono::{TimeZone, Utc};
    use futures::future::BoxFuture;
    use ingest_core::config::IngestConfig;
    use object_store::memory::InMemory;
    use object_store::PutResult;

    fn backend(provider: Provider, buckets: &[&str]) -> ObjectStoreBackend {
        let cfg = IngestConfig {
            retry_max_retries: 0,
            ..Default::default()
        }
        .storage_config(provider);
        let mut backend = ObjectStoreBackend::new(&cfg).unwrap();
        for bucket in buckets {
            backend = backend.with_bucket(
                *bucket,
                BucketHandle {
                    store: Arc::new(InMemory::new()),
                    copier: None,
                },
            );
        }
        backend
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
    }

    fn put(backend: &ObjectStoreBackend, bucket: &str, key: &str, data: Vec<u8>) {
        let store = backend.store(bucket).unwrap();
        backend
            .runtime
            .block_on(store.put(&ObjectPath::from(key), PutPayload::from(data)))
            .unwrap();
    }

    fn read_all(backend: &ObjectStoreBackend, bucket: &str, key: &str) -> Vec<u8> {
        let mut out = Vec::new();
        backend.open(bucket, key).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    fn opts(chunk_size: usize) -> UploadOptions {
        UploadOptions {
            chunk_size,
            part_concurrency: 2,
        }
    }

    #[derive(Debug, Default)]
    struct RecordingUpload {
        parts: Vec<usize>,
    }

    #[async_trait::async_trait]
    impl MultipartUpload for RecordingUpload {
        fn put_part(&mut self, data: PutPayload) -> object_store::UploadPart {
            self.parts.push(data.content_length());
            Box::pin(async { Ok(()) })
        }

        async fn complete(&mut self) -> object_store::Result<PutResult> {
            Ok(PutResult {
                e_tag: None,
                version: None,
            })
        }

        async fn abort(&mut self) -> object_store::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingCopy {
        calls: Mutex<Vec<String>>,
    }

    impl ServerSideCopy for RecordingCopy {
        fn copy<'a>(
            &'a self,
            src: &'a ObjectUri,
            dst_bucket: &'a str,
            dst_key: &'a str,
        ) -> BoxFuture<'a, object_store::Result<()>> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{src} -> {dst_bucket}/{dst_key}"));
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn gcs_plain_etag_is_reported_as_md5() {
        let meta = ObjectMeta {
            location: ObjectPath::from("a/b"),
            last_modified: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            size: 3,
            e_tag: Some("\"900150983cd24fb0d6963f7d28e17f72\"".into()),
            version: None,
        };
        let gcs = describe_meta(Provider::Gcs, &meta);
        assert_eq!(gcs.md5.as_deref(), Some("900150983cd24fb0d6963f7d28e17f72"));
        assert_eq!(gcs.last_modified, "2024-05-01T12:00:00Z");
        let s3 = describe_meta(Provider::Aws, &meta);
        assert_eq!(s3.e_tag.as_deref(), Some("900150983cd24fb0d6963f7d28e17f72"));
        assert!(s3.md5.is_none());
    }

    #[test]
    fn not_found_is_not_retryable() {
        let err = ObjectStoreError::NotFound {
            path: "x".into(),
            source: "missing".into(),
        };
        assert!(!is_retryable(&err));
        assert!(map_err(err).is_not_found());
        let generic = ObjectStoreError::Generic {
            store: "S3",
            source: "boom".into(),
        };
        assert!(is_retryable(&generic));
    }

    #[test]
    fn multi_chunk_object_streams_between_backends() {
        let source = backend(Provider::Gcs, &["src"]);
        let dest = backend(Provider::Aws, &["dst"]);
        let data = pattern(3 * MIN_PART_SIZE + READ_AHEAD / 2 + 123);
        put(&source, "src", "big.bin", data.clone());

        let mut reader = source.open("src", "big.bin").unwrap();
        let written = dest
            .upload("dst", "copy/big.bin", &mut reader, &opts(MIN_PART_SIZE))
            .unwrap();

        assert_eq!(written, data.len() as u64);
        assert_eq!(read_all(&dest, "dst", "copy/big.bin"), data);
    }

    #[test]
    fn parts_are_cut_at_exact_chunk_size() {
        let b = backend(Provider::Aws, &[]);
        let chunk = 1024;
        let mut upload = RecordingUpload::default();
        let mut rest = Cursor::new(pattern(2 * chunk + chunk / 2));
        let first = [pattern(chunk), pattern(chunk)];

        let total = b.send_parts(&mut upload, &mut rest, first, &opts(chunk)).unwrap();

        assert_eq!(total, (4 * chunk + chunk / 2) as u64);
        assert_eq!(upload.parts, vec![chunk, chunk, chunk, chunk, chunk / 2]);
    }

    #[test]
    fn data_within_one_chunk_is_a_single_put() {
        let b = backend(Provider::Aws, &["dst"]);
        let data = pattern(1000);
        let written = b
            .upload("dst", "k", &mut Cursor::new(data.clone()), &opts(1000))
            .unwrap();
        assert_eq!(written, 1000);
        assert_eq!(read_all(&b, "dst", "k"), data);
        assert_eq!(b.describe("dst", "k").unwrap().unwrap().size, 1000);
    }

    #[test]
    fn multipart_below_provider_minimum_is_rejected() {
        let b = backend(Provider::Aws, &["dst"]);
        let err = b
            .upload("dst", "k", &mut Cursor::new(pattern(3000)), &opts(1000))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(b.describe("dst", "k").unwrap().is_none());
    }

    #[test]
    fn prefix_lookup_returns_first_key_under_prefix() {
        let b = backend(Provider::Gcs, &["dst"]);
        put(&b, "dst", "123/seg/a.txt", b"a".to_vec());
        put(&b, "dst", "1234/seg/b.txt", b"b".to_vec());

        assert_eq!(
            b.first_under_prefix("dst", "123/").unwrap().as_deref(),
            Some("123/seg/a.txt")
        );
        assert!(b.first_under_prefix("dst", "999/").unwrap().is_none());
    }

    #[test]
    fn missing_objects_are_answers_not_errors() {
        let b = backend(Provider::Aws, &["dst"]);
        assert!(b.bucket_exists("dst").unwrap());
        assert!(b.describe("dst", "nope").unwrap().is_none());
        b.delete("dst", "nope").unwrap();
        assert!(matches!(b.open("dst", "nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn missing_bucket_errors_are_recognised() {
        let no_such_bucket = ObjectStoreError::Generic {
            store: "S3",
            source: "Error performing list request: NoSuchBucket: The specified bucket does not exist".into(),
        };
        assert!(is_missing_bucket(&no_such_bucket));
        let throttled = ObjectStoreError::Generic {
            store: "S3",
            source: "SlowDown".into(),
        };
        assert!(!is_missing_bucket(&throttled));
    }

    #[test]
    fn same_bucket_copy_uses_the_store() {
        let b = backend(Provider::Aws, &["dst"]);
        put(&b, "dst", "tmp/seg/f", b"content".to_vec());
        b.copy_from(&ObjectUri::new(Provider::Aws, "dst", "tmp/seg/f"), "dst", "d/seg/f")
            .unwrap();
        assert_eq!(read_all(&b, "dst", "d/seg/f"), b"content");
    }

    #[test]
    fn cross_bucket_copy_goes_through_the_provider_copier() {
        let copier = Arc::new(RecordingCopy::default());
        let b = backend(Provider::Aws, &[]).with_bucket(
            "dst",
            BucketHandle {
                store: Arc::new(InMemory::new()),
                copier: Some(copier.clone() as Arc<dyn ServerSideCopy>),
            },
        );

        b.copy_from(&ObjectUri::new(Provider::Aws, "src", "k"), "dst", "d/k")
            .unwrap();

        assert_eq!(*copier.calls.lock().unwrap(), vec!["s3://src/k -> dst/d/k".to_string()]);
    }

    #[test]
    fn cross_provider_or_copier_less_copy_is_unsupported() {
        let b = backend(Provider::Aws, &["dst"]);
        let from_gcs = b.copy_from(&ObjectUri::new(Provider::Gcs, "src", "k"), "dst", "d/k");
        assert!(matches!(from_gcs, Err(Error::Unsupported(_))));
        let no_copier = b.copy_from(&ObjectUri::new(Provider::Aws, "src", "k"), "dst", "d/k");
        assert!(matches!(no_copier, Err(Error::Unsupported(_))));
    }
}
