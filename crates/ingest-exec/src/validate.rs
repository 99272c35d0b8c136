//! Up-front validation. Every problem across all rows is collected before
//! anything is written, so an operator sees the full list in one pass.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

use ingest_core::config::IngestConfig;
use ingest_core::digest::{crc32c_to_base64, is_plain_md5, Crc32cIndex};
use ingest_core::location::{Provider, Source};
use ingest_core::manifest::ManifestRow;
use ingest_io::storage::Backends;
use tracing::{debug, info};

use crate::capability::BucketCapabilityCache;

/// Aggregated validation problems, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub problems: Vec<String>,
}

impl ValidationReport {
    pub fn push(&mut self, problem: impl Into<String>) {
        self.problems.push(problem.into());
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} problem(s)", self.problems.len())?;
        for problem in &self.problems {
            write!(f, "\n  - {problem}")?;
        }
        Ok(())
    }
}

/// Destination bucket of a row: the fixed `--bucket`, else `{study_id}--{consent_group}`.
pub fn destination_bucket(cfg: &IngestConfig, row: &ManifestRow) -> Option<String> {
    if let Some(bucket) = &cfg.bucket {
        return Some(bucket.clone());
    }
    if row.study_id.is_empty() || row.consent_group.is_empty() {
        return None;
    }
    Some(format!("{}--{}", row.study_id, row.consent_group))
}

pub struct Validator<'a> {
    cfg: &'a IngestConfig,
    backends: &'a Backends,
    capabilities: &'a BucketCapabilityCache,
    crc_index: &'a Crc32cIndex,
}

impl<'a> Validator<'a> {
    pub fn new(
        cfg: &'a IngestConfig,
        backends: &'a Backends,
        capabilities: &'a BucketCapabilityCache,
        crc_index: &'a Crc32cIndex,
    ) -> Self {
        Self {
            cfg,
            backends,
            capabilities,
            crc_index,
        }
    }

    /// Check sources, bucket naming and bucket writability. Remote
    /// descriptions pre-fill sizes and digests on `rows`. `Err` only when a
    /// strict capability probe could not be answered.
    pub fn validate(&self, rows: &mut [ManifestRow]) -> ingest_io::Result<ValidationReport> {
        let mut report = ValidationReport::default();
        let root = self.cfg.source_root.as_deref().map(Path::new);

        let mut seen = HashSet::with_capacity(rows.len());
        for row in rows.iter() {
            if !seen.insert(row.key()) {
                report.push(format!("duplicate row {}", row.key()));
            }
        }

        let mut buckets = BTreeSet::new();
        for row in rows.iter_mut() {
            self.check_source(row, root, &mut report);
            match destination_bucket(self.cfg, row) {
                Some(bucket) => {
                    buckets.insert(bucket);
                }
                None => report.push(format!(
                    "row {}: no destination bucket (consent_group is empty and no --bucket given)",
                    row.key()
                )),
            }
        }

        for provider in self.cfg.targets.providers() {
            for bucket in &buckets {
                if !self.capabilities.is_writable(provider, bucket)? {
                    report.push(format!(
                        "bucket {}://{bucket} does not exist or is not writable",
                        provider.scheme()
                    ));
                } else if self.cfg.verify_only {
                    info!("bucket is writable: {}://{bucket}", provider.scheme());
                }
            }
        }
        Ok(report)
    }

    fn check_source(&self, row: &mut ManifestRow, root: Option<&Path>, report: &mut ValidationReport) {
        let source = match Source::classify(&row.input_file_path, root) {
            Ok(source) => source,
            Err(e) => {
                report.push(format!("row {}: {e}", row.key()));
                return;
            }
        };
        match source {
            Source::Local(path) => match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() => {
                    row.source_size.get_or_insert(meta.len());
                }
                _ => report.push(format!("file not readable: {}", path.display())),
            },
            Source::Remote(uri) => {
                let storage = match self.backends.get(uri.provider) {
                    Ok(storage) => storage,
                    Err(e) => {
                        report.push(format!("{uri}: {e}"));
                        return;
                    }
                };
                match storage.describe(&uri.bucket, &uri.key) {
                    Ok(Some(desc)) => {
                        row.source_size.get_or_insert(desc.size);
                        match uri.provider {
                            Provider::Aws => {
                                if let Some(tag) = desc.e_tag {
                                    if is_plain_md5(&tag) && row.content_md5.is_none() {
                                        row.content_md5 = Some(tag.clone());
                                    }
                                    row.aws_tag.get_or_insert(tag);
                                }
                            }
                            Provider::Gcs => {
                                if row.content_md5.is_none() {
                                    row.content_md5 = desc.md5;
                                }
                                if let Some(crc) = desc.crc32c {
                                    self.crc_index.record(&row.input_file_path, crc);
                                    row.gcs_crc32c.get_or_insert_with(|| crc32c_to_base64(crc));
                                }
                            }
                        }
                        debug!(source = %uri, "remote source described");
                    }
                    Ok(None) => report.push(format!("object not found: {uri}")),
                    Err(e) => report.push(format!("{uri}: {e}")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ProbeMode;
    use ingest_core::config::Targets;
    use ingest_io::MemoryStorage;
    use std::sync::Arc;

    fn config(dir: &Path) -> IngestConfig {
        IngestConfig {
            targets: Targets {
                aws: true,
                gcs: false,
            },
            source_root: Some(dir.display().to_string()),
            ..Default::default()
        }
    }

    fn row(path: &str, consent: &str) -> ManifestRow {
        let mut row = ManifestRow::new("phs1", path);
        row.consent_group = consent.to_string();
        row
    }

    #[test]
    fn bucket_name_comes_from_study_and_consent() {
        let cfg = IngestConfig::default();
        assert_eq!(destination_bucket(&cfg, &row("a", "c1")).as_deref(), Some("phs1--c1"));
        assert_eq!(destination_bucket(&cfg, &row("a", "")), None);
        let fixed = IngestConfig {
            bucket: Some("fixed".into()),
            ..Default::default()
        };
        assert_eq!(destination_bucket(&fixed, &row("a", "")).as_deref(), Some("fixed"));
    }

    #[test]
    fn problems_are_aggregated_across_rows() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.txt"), b"hello").unwrap();
        let s3 = MemoryStorage::new(Provider::Aws);
        s3.deny_writes("phs1--c1");
        let backends = Backends::new().with(Arc::new(s3));
        let cfg = config(dir.path());
        let caps = BucketCapabilityCache::new(backends.clone(), ProbeMode::Lenient);
        let crc = Crc32cIndex::new();

        let mut rows = vec![row("ok.txt", "c1"), row("missing.txt", "c1"), row("ok.txt", "c1")];
        let report = Validator::new(&cfg, &backends, &caps, &crc)
            .validate(&mut rows)
            .unwrap();

        assert_eq!(report.len(), 3, "{report}");
        assert!(report.problems[0].starts_with("duplicate row"));
        assert!(report.problems[1].contains("missing.txt"));
        assert!(report.problems[2].contains("s3://phs1--c1"));
        assert_eq!(rows[0].source_size, Some(5));
    }

    #[test]
    fn remote_descriptions_prefill_digests() {
        let dir = tempfile::tempdir().unwrap();
        let s3 = MemoryStorage::new(Provider::Aws);
        s3.create_bucket("phs1--c1");
        s3.insert("src", "data/a.bin", b"abc".to_vec());
        let gcs = MemoryStorage::new(Provider::Gcs);
        gcs.insert("gsrc", "b.bin", b"abc".to_vec());
        let backends = Backends::new().with(Arc::new(s3)).with(Arc::new(gcs));
        let cfg = config(dir.path());
        let caps = BucketCapabilityCache::new(backends.clone(), ProbeMode::Strict);
        let crc = Crc32cIndex::new();

        let mut rows = vec![row("s3://src/data/a.bin", "c1"), row("gs://gsrc/b.bin", "c1")];
        let report = Validator::new(&cfg, &backends, &caps, &crc)
            .validate(&mut rows)
            .unwrap();
        assert!(report.is_empty(), "{report}");

        let md5 = "900150983cd24fb0d6963f7d28e17f72";
        assert_eq!(rows[0].aws_tag.as_deref(), Some(md5));
        assert_eq!(rows[0].content_md5.as_deref(), Some(md5));
        assert_eq!(rows[0].source_size, Some(3));
        assert_eq!(rows[1].content_md5.as_deref(), Some(md5));
        assert!(rows[1].gcs_crc32c.is_some());
        assert!(crc.get("gs://gsrc/b.bin").is_some());
    }

    #[test]
    fn strict_probe_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.txt"), b"x").unwrap();
        let s3 = MemoryStorage::new(Provider::Aws);
        s3.set_authorization_unreachable(true);
        let backends = Backends::new().with(Arc::new(s3));
        let cfg = config(dir.path());
        let caps = BucketCapabilityCache::new(backends.clone(), ProbeMode::Strict);
        let crc = Crc32cIndex::new();
        let mut rows = vec![row("ok.txt", "c1")];
        assert!(Validator::new(&cfg, &backends, &caps, &crc)
            .validate(&mut rows)
            .is_err());
    }
}
