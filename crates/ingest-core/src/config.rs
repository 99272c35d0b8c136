//! Engine configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::digest::DEFAULT_CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::id::DEFAULT_AUTHORITY;
use crate::location::Provider;

/// Which providers a run writes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targets {
    pub aws: bool,
    pub gcs: bool,
}

impl Targets {
    /// Transfer order: GCS first, then S3.
    pub fn providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.contains(*p))
            .collect()
    }

    pub fn contains(&self, provider: Provider) -> bool {
        match provider {
            Provider::Aws => self.aws,
            Provider::Gcs => self.gcs,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.aws || self.gcs)
    }

    /// Parse `s3,gs`-style lists.
    pub fn parse(list: &str) -> Result<Self> {
        let mut targets = Targets::default();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match Provider::from_scheme(item) {
                Some(Provider::Aws) => targets.aws = true,
                Some(Provider::Gcs) => targets.gcs = true,
                None => return Err(Error::Config(format!("unknown target provider '{item}'"))),
            }
        }
        Ok(targets)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub targets: Targets,

    /// Chunk size for reads, multipart parts and the S3 tag.
    pub chunk_size: usize,

    pub checksum_threads: usize,
    pub upload_threads: usize,

    /// In-flight multipart parts per upload.
    pub part_concurrency: usize,

    /// Cross-provider objects smaller than this are staged locally; larger ones stream.
    pub max_download_size: u64,

    pub resume: bool,

    /// Validate sources and buckets, then stop.
    pub verify_only: bool,

    /// Fixed destination bucket; otherwise `{study_id}--{consent_group}`.
    pub bucket: Option<String>,

    /// Base directory for relative local input paths.
    pub source_root: Option<String>,

    /// Fail rows whose post-transfer checksum does not match.
    pub strict_integrity: bool,

    pub upload_receipt: bool,

    pub staging_dir: Option<String>,

    pub identifier_authority: String,

    /// Deadline applied to every provider call.
    pub call_timeout_ms: u64,

    /// Cloud credential hints / overrides.
    pub aws_region: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_session_token: Option<String>,
    pub aws_endpoint: Option<String>,
    pub gcs_service_account_path: Option<String>,

    pub retry_max_retries: usize,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            targets: Targets::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            checksum_threads: cpus,
            upload_threads: 1,
            part_concurrency: 4,
            max_download_size: 2000 * 1024 * 1024, // 2000 MB
            resume: false,
            verify_only: false,
            bucket: None,
            source_root: None,
            strict_integrity: true,
            upload_receipt: true,
            staging_dir: None,
            identifier_authority: DEFAULT_AUTHORITY.to_string(),
            call_timeout_ms: 300_000,
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_session_token: None,
            aws_endpoint: None,
            gcs_service_account_path: None,
            retry_max_retries: 3,
            retry_initial_backoff_ms: 200,
            retry_max_backoff_ms: 5_000,
        }
    }
}

/// Per-provider snapshot handed to the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub provider: Provider,
    pub aws_region: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_session_token: Option<String>,
    pub aws_endpoint: Option<String>,
    pub gcs_service_account_path: Option<String>,
    pub call_timeout_ms: u64,
    pub retry_max_retries: usize,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl StorageConfig {
    pub fn scheme(&self) -> &'static str {
        self.provider.scheme()
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl IngestConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `INGEST_TARGETS`: comma list of `s3`, `gs`
    /// - `INGEST_CHUNK_SIZE`: chunk size in bytes
    /// - `INGEST_CHECKSUM_THREADS` / `INGEST_UPLOAD_THREADS`: worker counts
    /// - `INGEST_PART_CONCURRENCY`: in-flight parts per multipart upload
    /// - `INGEST_MAX_DOWNLOAD_SIZE`: staging threshold in bytes
    /// - `INGEST_RESUME`, `INGEST_TEST`, `INGEST_STRICT_INTEGRITY`, `INGEST_UPLOAD_RECEIPT`: booleans
    /// - `INGEST_BUCKET`, `INGEST_SOURCE_ROOT`, `INGEST_STAGING_DIR`
    /// - `INGEST_AWS_*`, `INGEST_GCS_SERVICE_ACCOUNT`: credential overrides
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("INGEST_TARGETS") {
            if let Ok(v) = Targets::parse(&s) {
                cfg.targets = v;
            }
        }

        if let Ok(s) = std::env::var("INGEST_CHUNK_SIZE") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.chunk_size = v;
            }
        }

        if let Ok(s) = std::env::var("INGEST_CHECKSUM_THREADS") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.checksum_threads = v;
            }
        }

        if let Ok(s) = std::env::var("INGEST_UPLOAD_THREADS") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.upload_threads = v;
            }
        }

        if let Ok(s) = std::env::var("INGEST_PART_CONCURRENCY") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.part_concurrency = v;
            }
        }

        if let Ok(s) = std::env::var("INGEST_MAX_DOWNLOAD_SIZE") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.max_download_size = v;
            }
        }

        if let Ok(s) = std::env::var("INGEST_RESUME") {
            if let Some(v) = parse_bool(&s) {
                cfg.resume = v;
            }
        }

        if let Ok(s) = std::env::var("INGEST_TEST") {
            if let Some(v) = parse_bool(&s) {
                cfg.verify_only = v;
            }
        }

        if let Ok(s) = std::env::var("INGEST_STRICT_INTEGRITY") {
            if let Some(v) = parse_bool(&s) {
                cfg.strict_integrity = v;
            }
        }

        if let Ok(s) = std::env::var("INGEST_UPLOAD_RECEIPT") {
            if let Some(v) = parse_bool(&s) {
                cfg.upload_receipt = v;
            }
        }

        if let Ok(s) = std::env::var("INGEST_BUCKET") {
            cfg.bucket = Some(s);
        }

        if let Ok(s) = std::env::var("INGEST_SOURCE_ROOT") {
            cfg.source_root = Some(s);
        }

        if let Ok(s) = std::env::var("INGEST_STAGING_DIR") {
            cfg.staging_dir = Some(s);
        }

        if let Ok(s) = std::env::var("INGEST_IDENTIFIER_AUTHORITY") {
            cfg.identifier_authority = s;
        }

        if let Ok(s) = std::env::var("INGEST_CALL_TIMEOUT_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.call_timeout_ms = v;
            }
        }

        if let Ok(s) = std::env::var("INGEST_AWS_REGION") {
            cfg.aws_region = Some(s);
        }

        if let Ok(s) = std::env::var("INGEST_AWS_ACCESS_KEY_ID") {
            cfg.aws_access_key_id = Some(s);
        }

        if let Ok(s) = std::env::var("INGEST_AWS_SECRET_ACCESS_KEY") {
            cfg.aws_secret_access_key = Some(s);
        }

        if let Ok(s) = std::env::var("INGEST_AWS_SESSION_TOKEN") {
            cfg.aws_session_token = Some(s);
        }

        if let Ok(s) = std::env::var("INGEST_AWS_ENDPOINT") {
            cfg.aws_endpoint = Some(s);
        }

        if let Ok(s) = std::env::var("INGEST_GCS_SERVICE_ACCOUNT") {
            cfg.gcs_service_account_path = Some(s);
        }

        if let Ok(s) = std::env::var("INGEST_MAX_RETRIES") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.retry_max_retries = v;
            }
        }

        if let Ok(s) = std::env::var("INGEST_RETRY_INITIAL_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.retry_initial_backoff_ms = v;
            }
        }

        if let Ok(s) = std::env::var("INGEST_RETRY_MAX_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.retry_max_backoff_ms = v;
            }
        }

        cfg
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(Error::Config(
                "no target provider selected (use --gs and/or --aws)".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk size must be positive".into()));
        }
        if self.checksum_threads == 0 || self.upload_threads == 0 || self.part_concurrency == 0 {
            return Err(Error::Config("thread counts must be positive".into()));
        }
        if self.max_download_size == 0 {
            return Err(Error::Config("max download size must be positive".into()));
        }
        if let Some(bucket) = &self.bucket {
            if bucket.is_empty() || bucket.contains('/') {
                return Err(Error::Config(format!("invalid bucket name '{bucket}'")));
            }
        }
        Ok(())
    }

    /// Produce a storage configuration snapshot used by the IO layer.
    pub fn storage_config(&self, provider: Provider) -> StorageConfig {
        StorageConfig {
            provider,
            aws_region: self.aws_region.clone(),
            aws_access_key_id: self.aws_access_key_id.clone(),
            aws_secret_access_key: self.aws_secret_access_key.clone(),
            aws_session_token: self.aws_session_token.clone(),
            aws_endpoint: self.aws_endpoint.clone(),
            gcs_service_account_path: self.gcs_service_account_path.clone(),
            call_timeout_ms: self.call_timeout_ms,
            retry_max_retries: self.retry_max_retries,
            retry_initial_backoff_ms: self.retry_initial_backoff_ms,
            retry_max_backoff_ms: self.retry_max_backoff_ms,
        }
    }
}
