//! In-memory storage backend for testing.
//!
//! Behaves like one provider: S3-flavoured instances report multipart entity
//! tags computed with the caller's chunk size, GCS-flavoured ones report MD5
//! and CRC32C. Buckets must be created explicitly. Write denial, an unreachable
//! authorization service, failing uploads and corrupted checksums can be
//! injected.

use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{SecondsFormat, Utc};
use ingest_core::digest::{DigestSelection, MultiDigest};
use ingest_core::location::{ObjectUri, Provider};

use crate::buf::read_chunk;
use crate::error::{Error, Result};
use crate::storage::{ObjectDescription, ObjectStorage, UploadOptions};

type UploadHook = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Arc<Vec<u8>>,
    e_tag: String,
    md5: String,
    crc32c: u32,
    modified: String,
}

#[derive(Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    read_only: HashSet<String>,
    auth_unreachable: bool,
    corrupt_checksums: bool,
    uploads: usize,
    copies: usize,
    fail_uploads_after: Option<usize>,
}

/// Thread-safe in-memory object storage.
#[derive(Clone)]
pub struct MemoryStorage {
    provider: Provider,
    state: Arc<Mutex<State>>,
    upload_hook: Arc<Mutex<Option<UploadHook>>>,
}

impl MemoryStorage {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            state: Arc::new(Mutex::new(State::default())),
            upload_hook: Arc::new(Mutex::new(None)),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_bucket(&self, bucket: &str) -> &Self {
        self.state().buckets.entry(bucket.to_string()).or_default();
        self
    }

    /// Bucket exists but the principal may not write to it.
    pub fn deny_writes(&self, bucket: &str) -> &Self {
        self.create_bucket(bucket);
        self.state().read_only.insert(bucket.to_string());
        self
    }

    /// Capability probes fail instead of answering.
    pub fn set_authorization_unreachable(&self, unreachable: bool) {
        self.state().auth_unreachable = unreachable;
    }

    /// Report wrong checksums from `describe`.
    pub fn corrupt_reported_checksums(&self, corrupt: bool) {
        self.state().corrupt_checksums = corrupt;
    }

    /// Uploads beyond the first `n` fail with a storage error.
    pub fn fail_uploads_after(&self, n: usize) {
        self.state().fail_uploads_after = Some(n);
    }

    /// Called with the running upload count after each successful upload.
    pub fn set_upload_hook(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.upload_hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Pre-populate an object as if it had been uploaded in one put.
    pub fn insert(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        let len = bytes.len().max(1);
        let object = self.stored(bytes, len);
        self.state()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.state()
            .buckets
            .get(bucket)
            .map_or(false, |b| b.contains_key(key))
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.bytes.as_ref().clone())
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state()
            .buckets
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn upload_count(&self) -> usize {
        self.state().uploads
    }

    pub fn copy_count(&self) -> usize {
        self.state().copies
    }

    fn stored(&self, bytes: Vec<u8>, chunk_size: usize) -> StoredObject {
        let mut digest = MultiDigest::new(chunk_size, DigestSelection::ALL);
        digest.update(&bytes);
        let digests = digest.finish();
        let md5 = digests.md5.unwrap_or_default();
        let e_tag = match self.provider {
            Provider::Aws => digests.multipart_tag.unwrap_or_default(),
            Provider::Gcs => md5.clone(),
        };
        StoredObject {
            bytes: Arc::new(bytes),
            e_tag,
            md5,
            crc32c: digests.crc32c.unwrap_or_default(),
            modified: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    fn bucket_missing(bucket: &str) -> Error {
        Error::NotFound(format!("bucket {bucket}"))
    }
}

impl ObjectStorage for MemoryStorage {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let state = self.state();
        if state.auth_unreachable {
            return Err(Error::Storage("storage service unreachable".into()));
        }
        Ok(state.buckets.contains_key(bucket))
    }

    fn can_write(&self, bucket: &str) -> Result<bool> {
        let state = self.state();
        if state.auth_unreachable {
            return Err(Error::Storage("authorization service unreachable".into()));
        }
        Ok(state.buckets.contains_key(bucket) && !state.read_only.contains(bucket))
    }

    fn describe(&self, bucket: &str, key: &str) -> Result<Option<ObjectDescription>> {
        let state = self.state();
        let Some(object) = state.buckets.get(bucket).and_then(|b| b.get(key)) else {
            return Ok(None);
        };
        let (e_tag, md5, crc32c) = if state.corrupt_checksums {
            ("0".repeat(32), "0".repeat(32), object.crc32c ^ 0xFFFF_FFFF)
        } else {
            (object.e_tag.clone(), object.md5.clone(), object.crc32c)
        };
        let gcs = self.provider == Provider::Gcs;
        Ok(Some(ObjectDescription {
            size: object.bytes.len() as u64,
            last_modified: object.modified.clone(),
            e_tag: Some(e_tag),
            md5: gcs.then_some(md5),
            crc32c: gcs.then_some(crc32c),
        }))
    }

    fn first_under_prefix(&self, bucket: &str, prefix: &str) -> Result<Option<String>> {
        let state = self.state();
        let objects = state
            .buckets
            .get(bucket)
            .ok_or_else(|| Self::bucket_missing(bucket))?;
        Ok(objects
            .range(prefix.to_string()..)
            .next()
            .map(|(k, _)| k)
            .filter(|k| k.starts_with(prefix))
            .cloned())
    }

    fn upload(
        &self,
        bucket: &str,
        key: &str,
        reader: &mut dyn Read,
        opts: &UploadOptions,
    ) -> Result<u64> {
        {
            let state = self.state();
            if !state.buckets.contains_key(bucket) {
                return Err(Self::bucket_missing(bucket));
            }
            if state.read_only.contains(bucket) {
                return Err(Error::Storage(format!("access denied to {bucket}")));
            }
            if let Some(limit) = state.fail_uploads_after {
                if state.uploads >= limit {
                    return Err(Error::Storage("injected upload failure".into()));
                }
            }
        }

        // Read part by part, as a multipart client would.
        let mut bytes = Vec::new();
        loop {
            let part = read_chunk(reader, opts.chunk_size.max(1))?;
            if part.is_empty() {
                break;
            }
            bytes.extend_from_slice(&part);
        }
        let len = bytes.len() as u64;
        let object = self.stored(bytes, opts.chunk_size);

        let count = {
            let mut state = self.state();
            state
                .buckets
                .entry(bucket.to_string())
                .or_default()
                .insert(key.to_string(), object);
            state.uploads += 1;
            state.uploads
        };
        let hook = self
            .upload_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(count);
        }
        Ok(len)
    }

    fn open(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send + '_>> {
        let bytes = self
            .state()
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| Arc::clone(&o.bytes))
            .ok_or_else(|| Error::NotFound(format!("{}://{bucket}/{key}", self.provider)))?;
        Ok(Box::new(Cursor::new(SharedBytes(bytes))))
    }

    fn copy_from(&self, src: &ObjectUri, dst_bucket: &str, dst_key: &str) -> Result<()> {
        if src.provider != self.provider {
            return Err(Error::Unsupported(format!(
                "cannot copy {src} into {}://{dst_bucket}",
                self.provider
            )));
        }
        let mut state = self.state();
        let object = state
            .buckets
            .get(&src.bucket)
            .and_then(|b| b.get(&src.key))
            .cloned()
            .ok_or_else(|| Error::NotFound(src.to_string()))?;
        let dst = state
            .buckets
            .get_mut(dst_bucket)
            .ok_or_else(|| Self::bucket_missing(dst_bucket))?;
        dst.insert(dst_key.to_string(), object);
        state.copies += 1;
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        if let Some(b) = self.state().buckets.get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }
}

struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
