//! Receipt manifests: naming, and the final upload as an audit artifact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use ingest_core::config::Targets;
use ingest_io::storage::{Backends, UploadOptions};
use tracing::{info, warn};

use crate::capability::BucketCapabilityCache;

/// `{stem}.manifest.{YYYYmmddHHMMSS}.tsv` next to `input` (a manifest file or
/// a source directory).
pub fn receipt_path(input: &Path, now: DateTime<Local>) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ingest".to_string());
    let name = format!("{stem}.manifest.{}.tsv", now.format("%Y%m%d%H%M%S"));
    match input.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Upload the receipt to every bucket proven writable for each target.
/// Failures are logged; returns the number of successful uploads.
pub fn upload_receipt(
    receipt: &Path,
    targets: Targets,
    backends: &Backends,
    capabilities: &BucketCapabilityCache,
    opts: &UploadOptions,
) -> usize {
    let Some(name) = receipt.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return 0;
    };
    let mut uploaded = 0;
    for provider in targets.providers() {
        let storage = match backends.get(provider) {
            Ok(storage) => storage,
            Err(e) => {
                warn!(%provider, error = %e, "receipt not uploaded");
                continue;
            }
        };
        for bucket in capabilities.writable_buckets(provider) {
            match storage.upload_file(&bucket, &name, receipt, opts) {
                Ok(_) => {
                    info!("receipt uploaded to {}://{bucket}/{name}", provider.scheme());
                    uploaded += 1;
                }
                Err(e) => warn!(%provider, bucket = %bucket, error = %e, "receipt upload failed"),
            }
        }
    }
    uploaded
}
