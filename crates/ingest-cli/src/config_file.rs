//! YAML configuration file (`--config`). Every key is optional; present keys
//! override the environment and are in turn overridden by CLI flags.

use std::fs;
use std::path::Path;

use ingest_core::config::{IngestConfig, Targets};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub targets: Option<String>,
    pub chunk_size: Option<usize>,
    pub checksum_threads: Option<usize>,
    pub upload_threads: Option<usize>,
    pub part_concurrency: Option<usize>,
    /// Megabytes.
    pub max_download_size_mb: Option<u64>,
    pub bucket: Option<String>,
    pub source_root: Option<String>,
    pub strict_integrity: Option<bool>,
    pub upload_receipt: Option<bool>,
    pub staging_dir: Option<String>,
    pub identifier_authority: Option<String>,
    pub call_timeout_ms: Option<u64>,
    pub aws_region: Option<String>,
    pub aws_endpoint: Option<String>,
    pub gcs_service_account: Option<String>,
    pub retry_max_retries: Option<usize>,
    pub retry_initial_backoff_ms: Option<u64>,
    pub retry_max_backoff_ms: Option<u64>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("cannot read config {}: {e}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply(&self, cfg: &mut IngestConfig) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(list) = &self.targets {
            cfg.targets = Targets::parse(list)?;
        }
        if let Some(v) = self.chunk_size {
            cfg.chunk_size = v;
        }
        if let Some(v) = self.checksum_threads {
            cfg.checksum_threads = v;
        }
        if let Some(v) = self.upload_threads {
            cfg.upload_threads = v;
        }
        if let Some(v) = self.part_concurrency {
            cfg.part_concurrency = v;
        }
        if let Some(mb) = self.max_download_size_mb {
            cfg.max_download_size = mb
                .checked_mul(1_000_000)
                .ok_or_else(|| format!("max_download_size_mb {mb} is too large"))?;
        }
        if let Some(v) = &self.bucket {
            cfg.bucket = Some(v.clone());
        }
        if let Some(v) = &self.source_root {
            cfg.source_root = Some(v.clone());
        }
        if let Some(v) = self.strict_integrity {
            cfg.strict_integrity = v;
        }
        if let Some(v) = self.upload_receipt {
            cfg.upload_receipt = v;
        }
        if let Some(v) = &self.staging_dir {
            cfg.staging_dir = Some(v.clone());
        }
        if let Some(v) = &self.identifier_authority {
            cfg.identifier_authority = v.clone();
        }
        if let Some(v) = self.call_timeout_ms {
            cfg.call_timeout_ms = v;
        }
        if let Some(v) = &self.aws_region {
            cfg.aws_region = Some(v.clone());
        }
        if let Some(v) = &self.aws_endpoint {
            cfg.aws_endpoint = Some(v.clone());
        }
        if let Some(v) = &self.gcs_service_account {
            cfg.gcs_service_account_path = Some(v.clone());
        }
        if let Some(v) = self.retry_max_retries {
            cfg.retry_max_retries = v;
        }
        if let Some(v) = self.retry_initial_backoff_ms {
            cfg.retry_initial_backoff_ms = v;
        }
        if let Some(v) = self.retry_max_backoff_ms {
            cfg.retry_max_backoff_ms = v;
        }
        Ok(())
    }
}
