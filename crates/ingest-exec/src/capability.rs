//! Bucket writability, probed once per (provider, bucket) for the whole process.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use ingest_core::location::Provider;
use ingest_io::storage::Backends;
use tracing::{debug, warn};

/// What to do when the provider cannot answer a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Propagate the error; used by verification runs.
    Strict,
    /// Treat the bucket as not writable.
    Lenient,
}

/// Memoized `IsWritable`. Positive and negative answers are both cached and
/// never re-probed. The map lock is held across the probe so each bucket is
/// probed by exactly one caller.
pub struct BucketCapabilityCache {
    backends: Backends,
    mode: ProbeMode,
    known: Mutex<HashMap<(Provider, String), bool>>,
}

impl BucketCapabilityCache {
    pub fn new(backends: Backends, mode: ProbeMode) -> Self {
        Self {
            backends,
            mode,
            known: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_writable(&self, provider: Provider, bucket: &str) -> ingest_io::Result<bool> {
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (provider, bucket.to_string());
        if let Some(writable) = known.get(&key) {
            return Ok(*writable);
        }

        let writable = match self.probe(provider, bucket) {
            Ok(writable) => writable,
            Err(e) if self.mode == ProbeMode::Lenient => {
                warn!(%provider, bucket, error = %e, "capability probe failed; treating bucket as not writable");
                false
            }
            Err(e) => return Err(e),
        };
        debug!(%provider, bucket, writable, "bucket probed");
        known.insert(key, writable);
        Ok(writable)
    }

    fn probe(&self, provider: Provider, bucket: &str) -> ingest_io::Result<bool> {
        let storage = self.backends.get(provider)?;
        if !storage.bucket_exists(bucket)? {
            warn!(%provider, bucket, "bucket does not exist");
            return Ok(false);
        }
        storage.can_write(bucket)
    }

    /// Buckets proven writable for `provider`, sorted.
    pub fn writable_buckets(&self, provider: Provider) -> Vec<String> {
        let known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        let mut buckets: Vec<String> = known
            .iter()
            .filter(|((p, _), writable)| *p == provider && **writable)
            .map(|((_, bucket), _)| bucket.clone())
            .collect();
        buckets.sort();
        buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_io::MemoryStorage;
    use std::sync::Arc;

    fn backends(storage: &MemoryStorage) -> Backends {
        Backends::new().with(Arc::new(storage.clone()))
    }

    #[test]
    fn answers_are_memoized() {
        let storage = MemoryStorage::new(Provider::Gcs);
        storage.create_bucket("open");
        storage.deny_writes("closed");
        let cache = BucketCapabilityCache::new(backends(&storage), ProbeMode::Strict);

        assert!(cache.is_writable(Provider::Gcs, "open").unwrap());
        assert!(!cache.is_writable(Provider::Gcs, "closed").unwrap());
        assert!(!cache.is_writable(Provider::Gcs, "missing").unwrap());

        // Later changes are not observed: negatives are not retried.
        storage.create_bucket("missing");
        assert!(!cache.is_writable(Provider::Gcs, "missing").unwrap());
        assert_eq!(cache.writable_buckets(Provider::Gcs), vec!["open".to_string()]);
    }

    #[test]
    fn unreachable_service_depends_on_mode() {
        let storage = MemoryStorage::new(Provider::Aws);
        storage.create_bucket("b");
        storage.set_authorization_unreachable(true);

        let strict = BucketCapabilityCache::new(backends(&storage), ProbeMode::Strict);
        assert!(strict.is_writable(Provider::Aws, "b").is_err());

        let lenient = BucketCapabilityCache::new(backends(&storage), ProbeMode::Lenient);
        assert!(!lenient.is_writable(Provider::Aws, "b").unwrap());
        storage.set_authorization_unreachable(false);
        assert!(!lenient.is_writable(Provider::Aws, "b").unwrap());
    }

    #[test]
    fn missing_backend_reads_as_not_writable() {
        let cache = BucketCapabilityCache::new(Backends::new(), ProbeMode::Lenient);
        assert!(!cache.is_writable(Provider::Aws, "b").unwrap());
    }
}
