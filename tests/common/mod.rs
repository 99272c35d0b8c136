//! Shared fixtures for the integration tests: scratch directories, manifests
//! and in-memory providers.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ingest_core::config::{IngestConfig, Targets};
use ingest_core::location::Provider;
use ingest_core::manifest::{ManifestRow, ManifestSchema, Variant};
use ingest_exec::{Engine, ExecError, RunInput, RunOutcome, RunReport};
use ingest_io::storage::Backends;
use ingest_io::tsv;
use ingest_io::MemoryStorage;

pub const BUCKET: &str = "phs001--c1";

pub fn config(targets: Targets) -> IngestConfig {
    IngestConfig {
        targets,
        chunk_size: 8,
        checksum_threads: 2,
        upload_threads: 2,
        upload_receipt: false,
        ..IngestConfig::default()
    }
}

pub fn gcs_only() -> Targets {
    Targets {
        aws: false,
        gcs: true,
    }
}

pub fn aws_only() -> Targets {
    Targets {
        aws: true,
        gcs: false,
    }
}

pub struct Providers {
    pub gcs: MemoryStorage,
    pub aws: MemoryStorage,
}

impl Providers {
    /// Both providers with the default destination bucket created.
    pub fn new() -> Self {
        let gcs = MemoryStorage::new(Provider::Gcs);
        let aws = MemoryStorage::new(Provider::Aws);
        gcs.create_bucket(BUCKET);
        aws.create_bucket(BUCKET);
        Self { gcs, aws }
    }

    pub fn backends(&self) -> Backends {
        Backends::new()
            .with(Arc::new(self.gcs.clone()))
            .with(Arc::new(self.aws.clone()))
    }
}

/// Write `files` under `dir/data` and a manifest `dir/batch.tsv` naming them
/// by absolute path.
pub fn write_batch(dir: &Path, files: &[(&str, &[u8])]) -> PathBuf {
    let data = dir.join("data");
    fs::create_dir_all(&data).unwrap();
    let mut rows = Vec::new();
    for (name, bytes) in files {
        let path = data.join(name);
        fs::write(&path, bytes).unwrap();
        rows.push(row(&path.display().to_string()));
    }
    write_manifest(dir, &rows)
}

pub fn row(input: &str) -> ManifestRow {
    let mut row = ManifestRow::new("phs001", input);
    row.consent_group = "c1".into();
    row
}

pub fn write_manifest(dir: &Path, rows: &[ManifestRow]) -> PathBuf {
    let path = dir.join("batch.tsv");
    let file = fs::File::create(&path).unwrap();
    tsv::write_manifest(file, &ManifestSchema::new(Variant::Standard), rows).unwrap();
    path
}

pub fn input(manifest: &Path) -> RunInput {
    let loaded = tsv::read_manifest(manifest, Variant::Standard).unwrap();
    RunInput {
        schema: loaded.schema,
        rows: loaded.rows,
        origin: manifest.to_path_buf(),
    }
}

pub fn run(engine: &Engine, manifest: &Path) -> Result<RunReport, ExecError> {
    match engine.run(input(manifest))? {
        RunOutcome::Completed(report) => Ok(report),
        RunOutcome::Verified { .. } => panic!("expected a transfer run"),
    }
}

pub fn rows_of(manifest: &Path) -> Vec<ManifestRow> {
    tsv::read_manifest(manifest, Variant::Standard).unwrap().rows
}

/// Receipt manifests written into `dir`.
pub fn receipts(dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.to_string_lossy().contains(".manifest."))
        .collect();
    found.sort();
    found
}
