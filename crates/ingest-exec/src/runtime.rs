//! Runtime: drive one ingest run from loaded rows to the receipt manifest.
//!
//! Phases run strictly in sequence (validation, receipt creation, imaging
//! stacks, checksums, one transfer phase per target provider, receipt upload);
//! rows within a phase run concurrently on a bounded [`WorkerPool`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ingest_core::config::IngestConfig;
use ingest_core::digest::Crc32cIndex;
use ingest_core::error::RowFailure;
use ingest_core::id::{DrsMinter, IdentifierMinter, RowId};
use ingest_core::location::Provider;
use ingest_core::manifest::{ManifestRow, ManifestSchema, Variant};
use ingest_io::storage::{Backends, UploadOptions};
use ingest_io::ManifestStore;

use crate::capability::{BucketCapabilityCache, ProbeMode};
use crate::checksum::ChecksumPhase;
use crate::imaging::{classify_slices, synthesize_stacks, ImagingConverter, ImagingError};
use crate::metrics::{MetricsSnapshot, RunMetrics};
use crate::receipt::{receipt_path, upload_receipt};
use crate::scheduler::{PhaseReport, WorkerPool};
use crate::transfer::Orchestrator;
use crate::validate::{ValidationReport, Validator};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("validation failed: {0}")]
    Validation(ValidationReport),

    #[error("authorization probe failed: {0}")]
    Authorization(String),

    #[error(transparent)]
    Io(#[from] ingest_io::Error),

    #[error(transparent)]
    Imaging(#[from] ImagingError),

    #[error("run interrupted; manifest saved to {}", .0.display())]
    Interrupted(PathBuf),
}

impl From<ingest_core::error::Error> for ExecError {
    fn from(e: ingest_core::error::Error) -> Self {
        ExecError::Config(e.to_string())
    }
}

/// Handle for the signal path: persists whatever manifest the current run
/// owns. Cheap to clone and safe to call from any thread.
#[derive(Clone, Default)]
pub struct ShutdownHook {
    store: Arc<Mutex<Option<Arc<ManifestStore>>>>,
}

impl ShutdownHook {
    fn set(&self, store: Arc<ManifestStore>) {
        *self.store.lock().unwrap_or_else(PoisonError::into_inner) = Some(store);
    }

    /// Persist the active manifest. Returns its path, or `None` when no
    /// manifest exists yet.
    pub fn flush(&self) -> Option<PathBuf> {
        let guard = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let store = guard.as_ref()?;
        if let Err(e) = store.persist() {
            error!(error = %e, "final manifest persist failed");
        }
        Some(store.path().to_path_buf())
    }
}

/// Rows as loaded by the caller. `origin` is the input manifest (or listed
/// directory); the receipt is written next to it.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub schema: ManifestSchema,
    pub rows: Vec<ManifestRow>,
    pub origin: PathBuf,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Validation-only run (`--test`).
    Verified { rows: usize },
    Completed(RunReport),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedRow {
    pub row: RowId,
    pub input_file_path: String,
    /// `None` for checksum failures.
    pub provider: Option<Provider>,
    pub failure: RowFailure,
}

#[derive(Debug)]
pub struct RunReport {
    pub manifest_path: PathBuf,
    pub rows: usize,
    /// Rows still missing a destination for at least one target.
    pub incomplete: usize,
    pub metrics: MetricsSnapshot,
    pub failures: Vec<FailedRow>,
}

pub struct Engine {
    cfg: IngestConfig,
    backends: Backends,
    minter: Box<dyn IdentifierMinter>,
    converter: Option<Box<dyn ImagingConverter>>,
    write_delay: Option<Duration>,
    cancel: CancellationToken,
    hook: ShutdownHook,
    metrics: Arc<RunMetrics>,
}

impl Engine {
    pub fn new(cfg: IngestConfig, backends: Backends) -> Self {
        let minter = Box::new(DrsMinter::new(cfg.identifier_authority.clone()));
        Self {
            cfg,
            backends,
            minter,
            converter: None,
            write_delay: None,
            cancel: CancellationToken::new(),
            hook: ShutdownHook::default(),
            metrics: Arc::new(RunMetrics::default()),
        }
    }

    pub fn with_minter(mut self, minter: Box<dyn IdentifierMinter>) -> Self {
        self.minter = minter;
        self
    }

    pub fn with_converter(mut self, converter: Box<dyn ImagingConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.cfg
    }

    /// Cancelling stops workers from taking new rows.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown_hook(&self) -> ShutdownHook {
        self.hook.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn run(&self, input: RunInput) -> Result<RunOutcome, ExecError> {
        self.cfg.validate()?;
        let RunInput {
            schema,
            mut rows,
            origin,
        } = input;

        if !self.cfg.resume {
            rows.iter_mut().for_each(ManifestRow::clear_computed);
        }
        if schema.variant() == Variant::Imaging {
            let slices = classify_slices(&mut rows);
            info!(slices, "DICOM slices classified");
        }

        let crc_index = Crc32cIndex::default();
        let mode = if self.cfg.verify_only {
            ProbeMode::Strict
        } else {
            ProbeMode::Lenient
        };
        let capabilities = BucketCapabilityCache::new(self.backends.clone(), mode);
        let report = Validator::new(&self.cfg, &self.backends, &capabilities, &crc_index)
            .validate(&mut rows)
            .map_err(|e| ExecError::Authorization(e.to_string()))?;
        if !report.is_empty() {
            return Err(ExecError::Validation(report));
        }
        info!(rows = rows.len(), "validation passed");
        if self.cfg.verify_only {
            return Ok(RunOutcome::Verified { rows: rows.len() });
        }

        let receipt = receipt_path(&origin, Local::now());
        let mut store = ManifestStore::create(&receipt, schema, rows)?;
        if let Some(delay) = self.write_delay {
            store = store.with_write_delay(delay);
        }
        let store = Arc::new(store);
        self.hook.set(Arc::clone(&store));
        store.persist()?;
        info!(manifest = %receipt.display(), "receipt manifest created");

        if store.schema().variant() == Variant::Imaging {
            match &self.converter {
                Some(converter) => {
                    let root = self.cfg.source_root.as_deref().map(std::path::Path::new);
                    let summary = synthesize_stacks(&store, converter.as_ref(), root)?;
                    info!(converted = summary.converted, failed = summary.failed, "imaging stacks");
                    store.persist()?;
                }
                None => warn!("no imaging converter configured; stacks are not converted"),
            }
        }

        let mut failures = Vec::new();
        self.checksum_phase(&store, &crc_index, &mut failures);
        self.check_cancelled(&store)?;

        for provider in self.cfg.targets.providers() {
            self.transfer_phase(provider, &store, &crc_index, &mut failures)?;
            self.check_cancelled(&store)?;
        }

        store.persist()?;
        if self.cfg.upload_receipt {
            let opts = UploadOptions {
                chunk_size: self.cfg.chunk_size,
                part_concurrency: self.cfg.part_concurrency,
            };
            upload_receipt(store.path(), self.cfg.targets, &self.backends, &capabilities, &opts);
        }
        self.metrics.emit_summary();

        let snapshot = store.snapshot();
        let incomplete = snapshot
            .iter()
            .filter(|row| {
                self.cfg
                    .targets
                    .providers()
                    .into_iter()
                    .any(|p| row.destination(p).is_none())
            })
            .count();
        Ok(RunOutcome::Completed(RunReport {
            manifest_path: store.path().to_path_buf(),
            rows: snapshot.len(),
            incomplete,
            metrics: self.metrics.snapshot(),
            failures,
        }))
    }

    fn checksum_phase(&self, store: &ManifestStore, crc_index: &Crc32cIndex, failures: &mut Vec<FailedRow>) {
        let phase = ChecksumPhase::new(
            store,
            self.cfg.targets,
            self.cfg.chunk_size,
            self.cfg.source_root.as_ref().map(PathBuf::from),
            crc_index,
        );
        let pool = WorkerPool::new("checksum", self.cfg.checksum_threads, self.cancel.clone());
        let report = pool.run(store.ids(), |id| phase.checksum_row(id));
        for (_, outcome) in &report.completed {
            self.metrics.record_checksum(*outcome);
        }
        self.collect_failures(store, None, report, failures);
    }

    fn transfer_phase(
        &self,
        provider: Provider,
        store: &ManifestStore,
        crc_index: &Crc32cIndex,
        failures: &mut Vec<FailedRow>,
    ) -> Result<(), ExecError> {
        let orchestrator = Orchestrator::new(
            provider,
            &self.cfg,
            &self.backends,
            store,
            self.minter.as_ref(),
            crc_index,
        )?;
        let name = match provider {
            Provider::Gcs => "transfer-gs",
            Provider::Aws => "transfer-s3",
        };
        let pool = WorkerPool::new(name, self.cfg.upload_threads, self.cancel.clone());
        let report = pool.run(store.ids(), |id| orchestrator.transfer_row(id));
        for (_, outcome) in &report.completed {
            self.metrics.record_transfer(*outcome);
        }
        self.collect_failures(store, Some(provider), report, failures);
        Ok(())
    }

    fn collect_failures<T>(
        &self,
        store: &ManifestStore,
        provider: Option<Provider>,
        report: PhaseReport<T>,
        failures: &mut Vec<FailedRow>,
    ) {
        if report.not_started > 0 {
            warn!(rows = report.not_started, "rows not started before cancellation");
        }
        for (row, failure) in report.failed {
            let input_file_path = store
                .get(row)
                .map(|r| r.input_file_path)
                .unwrap_or_default();
            error!(
                %row,
                file = %input_file_path,
                kind = failure.kind(),
                error = %failure,
                "row failed"
            );
            self.metrics.record_failure();
            failures.push(FailedRow {
                row,
                input_file_path,
                provider,
                failure,
            });
        }
    }

    fn check_cancelled(&self, store: &ManifestStore) -> Result<(), ExecError> {
        if !self.cancel.is_cancelled() {
            return Ok(());
        }
        store.persist()?;
        Err(ExecError::Interrupted(store.path().to_path_buf()))
    }
}
