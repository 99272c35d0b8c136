//! Transfer orchestrator: the per-row state machine for one destination provider.
//!
//! resume-skip -> existence check -> copy / upload / stage / stream -> verify
//! -> merge -> persist. Every step of a row runs on the worker that owns it; a
//! failed row keeps an empty destination so the next resume retries it.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ingest_core::config::IngestConfig;
use ingest_core::digest::{
    crc32c_to_base64, is_plain_md5, Crc32cIndex, DigestError, DigestSelection, DigestingReader,
    Digests,
};
use ingest_core::error::RowFailure;
use ingest_core::id::{Identifier, IdentifierMinter, RowId};
use ingest_core::location::{ObjectUri, Provider, Source};
use ingest_core::manifest::{Destination, ManifestRow};
use ingest_io::buf::digest_path;
use ingest_io::staging::StagingArea;
use ingest_io::storage::{Backends, ObjectDescription, ObjectStorage, UploadOptions};
use ingest_io::ManifestStore;
use tracing::{debug, error, info, warn};

use crate::checksum::merge_digests;
use crate::validate::destination_bucket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferOutcome {
    /// Resume mode found a complete destination.
    AlreadyPresent,
    /// Identical content already stored under the content-addressed prefix.
    Deduplicated,
    Uploaded,
    Copied,
    Staged,
    Streamed,
}

impl TransferOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferOutcome::AlreadyPresent => "already_present",
            TransferOutcome::Deduplicated => "deduplicated",
            TransferOutcome::Uploaded => "uploaded",
            TransferOutcome::Copied => "copied",
            TransferOutcome::Staged => "staged",
            TransferOutcome::Streamed => "streamed",
        }
    }

    /// Whether this run created the destination object.
    pub fn created_object(self) -> bool {
        !matches!(
            self,
            TransferOutcome::AlreadyPresent | TransferOutcome::Deduplicated
        )
    }
}

/// One lock per (bucket, digest): existence check and upload of identical
/// content never interleave. Entries live only while a handle is out.
#[derive(Default)]
pub struct DigestLocks {
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl DigestLocks {
    pub fn get(&self, bucket: &str, digest: &str) -> DigestLock<'_> {
        let key = (bucket.to_string(), digest.to_string());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = Arc::clone(locks.entry(key.clone()).or_default());
        DigestLock {
            owner: self,
            key,
            lock,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle on one digest lock; the map entry goes when the last handle drops.
pub struct DigestLock<'a> {
    owner: &'a DigestLocks,
    key: (String, String),
    lock: Arc<Mutex<()>>,
}

impl DigestLock<'_> {
    pub fn hold(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DigestLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // This handle and the map hold the last two references.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

/// Where a row's bytes ended up.
struct Landed {
    key: String,
    outcome: TransferOutcome,
    identifier: Option<Identifier>,
    /// Digests computed while moving the bytes, if any.
    digests: Option<Digests>,
}

impl Landed {
    fn dedup(key: String, identifier: Option<Identifier>, digests: Option<Digests>) -> Self {
        Self {
            key,
            outcome: TransferOutcome::Deduplicated,
            identifier,
            digests,
        }
    }
}

pub struct Orchestrator<'a> {
    provider: Provider,
    cfg: &'a IngestConfig,
    storage: &'a dyn ObjectStorage,
    backends: &'a Backends,
    store: &'a ManifestStore,
    minter: &'a dyn IdentifierMinter,
    crc_index: &'a Crc32cIndex,
    staging: StagingArea,
    locks: DigestLocks,
    source_root: Option<PathBuf>,
    opts: UploadOptions,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        provider: Provider,
        cfg: &'a IngestConfig,
        backends: &'a Backends,
        store: &'a ManifestStore,
        minter: &'a dyn IdentifierMinter,
        crc_index: &'a Crc32cIndex,
    ) -> ingest_io::Result<Self> {
        let storage = backends.get(provider)?.as_ref();
        Ok(Self {
            provider,
            cfg,
            storage,
            backends,
            store,
            minter,
            crc_index,
            staging: StagingArea::new(cfg.staging_dir.as_ref().map(PathBuf::from)),
            locks: DigestLocks::default(),
            source_root: cfg.source_root.as_ref().map(PathBuf::from),
            opts: UploadOptions {
                chunk_size: cfg.chunk_size,
                part_concurrency: cfg.part_concurrency,
            },
        })
    }

    pub fn transfer_row(&self, id: RowId) -> Result<TransferOutcome, RowFailure> {
        let row = self.store.get(id).map_err(io_failure)?;

        if self.cfg.resume {
            if let Some(dest) = row.destination(self.provider).filter(|d| self.well_formed(d)) {
                self.rederive_identifier(id, &row, &dest.path)?;
                info!(path = %dest.path, "already uploaded, skipping");
                return Ok(TransferOutcome::AlreadyPresent);
            }
        }

        let bucket = destination_bucket(self.cfg, &row).ok_or_else(|| {
            RowFailure::AuthorizationDenied(format!("row {} has no destination bucket", row.key()))
        })?;
        let source = Source::classify(&row.input_file_path, self.source_root.as_deref())
            .map_err(|e| RowFailure::SourceUnavailable(e.to_string()))?;

        let landed = match &source {
            Source::Local(path) => self.upload_local(&row, path, &bucket)?,
            Source::Remote(uri) if uri.provider == self.provider => {
                self.copy_remote(&row, uri, &bucket)?
            }
            Source::Remote(uri) => self.transfer_remote(&row, uri, &bucket, None)?,
        };
        self.finish(id, &row, &bucket, landed)
    }

    fn well_formed(&self, dest: &Destination) -> bool {
        ObjectUri::parse(&dest.path)
            .map(|uri| uri.provider == self.provider && !uri.key.is_empty())
            .unwrap_or(false)
    }

    fn rederive_identifier(&self, id: RowId, row: &ManifestRow, path: &str) -> Result<(), RowFailure> {
        if row.identifier.is_some() {
            return Ok(());
        }
        let Some(identifier) = self.minter.derive(path) else {
            return Ok(());
        };
        self.store
            .update(id, |r| {
                r.identifier.get_or_insert(identifier);
            })
            .map_err(io_failure)?;
        self.store.persist().map_err(io_failure)
    }

    /// The provider-native digest already known for `row`.
    fn row_digest(&self, row: &ManifestRow) -> Option<String> {
        match self.provider {
            Provider::Aws => row.aws_tag.clone(),
            Provider::Gcs => self
                .crc_index
                .get(&row.input_file_path)
                .or_else(|| {
                    row.gcs_crc32c.as_deref().and_then(|encoded| {
                        self.crc_index
                            .record_base64(&row.input_file_path, encoded)
                            .ok()
                    })
                })
                .map(|crc| crc.to_string()),
        }
    }

    fn computed_digest(&self, digests: &Digests) -> Result<String, RowFailure> {
        let digest = match self.provider {
            Provider::Aws => digests.multipart_tag.clone(),
            Provider::Gcs => digests.crc32c.map(|crc| crc.to_string()),
        };
        digest.ok_or_else(|| {
            RowFailure::TransferIo(format!("no {} digest was computed", self.provider))
        })
    }

    fn identifier_for(&self, row: &ManifestRow) -> Identifier {
        row.identifier.clone().unwrap_or_else(|| self.minter.mint())
    }

    fn content_key(&self, digest: &str, identifier: &Identifier, file_name: &str) -> String {
        format!("{digest}/{}/{file_name}", self.minter.key_segment(identifier))
    }

    fn find_existing(&self, bucket: &str, digest: &str) -> Result<Option<String>, RowFailure> {
        let found = self
            .storage
            .first_under_prefix(bucket, &format!("{digest}/"))
            .map_err(storage_failure)?;
        if let Some(key) = &found {
            debug!(bucket, key = %key, "content already stored");
        }
        Ok(found)
    }

    fn upload_local(&self, row: &ManifestRow, path: &Path, bucket: &str) -> Result<Landed, RowFailure> {
        let mut computed = None;
        let digest = match self.row_digest(row) {
            Some(digest) => digest,
            None => {
                let digests = digest_path(path, self.opts.chunk_size, DigestSelection::ALL)
                    .map_err(|e| digest_failure(path, e))?;
                let digest = self.computed_digest(&digests)?;
                computed = Some(digests);
                digest
            }
        };

        let lock = self.locks.get(bucket, &digest);
        let _held = lock.hold();
        if let Some(found) = self.find_existing(bucket, &digest)? {
            return Ok(Landed::dedup(found, None, computed));
        }

        let identifier = self.identifier_for(row);
        let key = self.content_key(&digest, &identifier, &row.file_name);
        info!(
            file = %path.display(),
            dest = %format!("{}://{bucket}/{key}", self.provider.scheme()),
            chunk_size = self.opts.chunk_size,
            "uploading"
        );
        self.storage
            .upload_file(bucket, &key, path, &self.opts)
            .map_err(storage_failure)?;
        Ok(Landed {
            key,
            outcome: TransferOutcome::Uploaded,
            identifier: Some(identifier),
            digests: computed,
        })
    }

    fn copy_remote(&self, row: &ManifestRow, uri: &ObjectUri, bucket: &str) -> Result<Landed, RowFailure> {
        let Some(digest) = self.row_digest(row) else {
            debug!(source = %uri, "native digest unknown; moving bytes instead of copying");
            return self.transfer_remote(row, uri, bucket, None);
        };

        let lock = self.locks.get(bucket, &digest);
        let held = lock.hold();
        if let Some(found) = self.find_existing(bucket, &digest)? {
            return Ok(Landed::dedup(found, None, None));
        }

        let identifier = self.identifier_for(row);
        let key = self.content_key(&digest, &identifier, &row.file_name);
        match self.storage.copy_from(uri, bucket, &key) {
            Ok(()) => {
                info!(source = %uri, dest = %key, "copied in place");
                Ok(Landed {
                    key,
                    outcome: TransferOutcome::Copied,
                    identifier: Some(identifier),
                    digests: None,
                })
            }
            Err(ingest_io::Error::Unsupported(reason)) => {
                drop(held);
                debug!(source = %uri, %reason, "server-side copy unavailable");
                self.transfer_remote(row, uri, bucket, Some(identifier))
            }
            Err(e) => Err(storage_failure(e)),
        }
    }

    fn transfer_remote(
        &self,
        row: &ManifestRow,
        uri: &ObjectUri,
        bucket: &str,
        identifier: Option<Identifier>,
    ) -> Result<Landed, RowFailure> {
        let source = self
            .backends
            .get(uri.provider)
            .map_err(|e| RowFailure::TransferIo(e.to_string()))?
            .as_ref();
        let size = match row.source_size {
            Some(size) => size,
            None => {
                source
                    .describe(&uri.bucket, &uri.key)
                    .map_err(storage_failure)?
                    .ok_or_else(|| RowFailure::SourceUnavailable(uri.to_string()))?
                    .size
            }
        };
        if size < self.cfg.max_download_size {
            self.stage_remote(row, source, uri, bucket, identifier)
        } else {
            self.stream_remote(row, source, uri, bucket, identifier)
        }
    }

    /// Download into a local staging file, digest it there, upload it.
    fn stage_remote(
        &self,
        row: &ManifestRow,
        source: &dyn ObjectStorage,
        uri: &ObjectUri,
        bucket: &str,
        identifier: Option<Identifier>,
    ) -> Result<Landed, RowFailure> {
        let staged = self
            .staging
            .download(source, &uri.bucket, &uri.key)
            .map_err(storage_failure)?;
        let digests = digest_path(staged.path(), self.opts.chunk_size, DigestSelection::ALL)
            .map_err(|e| digest_failure(staged.path(), e))?;
        let digest = self.computed_digest(&digests)?;

        let lock = self.locks.get(bucket, &digest);
        let _held = lock.hold();
        if let Some(found) = self.find_existing(bucket, &digest)? {
            return Ok(Landed::dedup(found, identifier, Some(digests)));
        }

        let identifier = identifier.unwrap_or_else(|| self.identifier_for(row));
        let key = self.content_key(&digest, &identifier, &row.file_name);
        info!(source = %uri, dest = %key, bytes = digests.bytes, "uploading staged copy");
        self.storage
            .upload_file(bucket, &key, staged.path(), &self.opts)
            .map_err(storage_failure)?;
        Ok(Landed {
            key,
            outcome: TransferOutcome::Staged,
            identifier: Some(identifier),
            digests: Some(digests),
        })
    }

    /// Pipe the source into a staging key while digesting, then promote it to
    /// its content-addressed key. The staging key is always removed.
    fn stream_remote(
        &self,
        row: &ManifestRow,
        source: &dyn ObjectStorage,
        uri: &ObjectUri,
        bucket: &str,
        identifier: Option<Identifier>,
    ) -> Result<Landed, RowFailure> {
        let identifier = identifier.unwrap_or_else(|| self.identifier_for(row));
        let staging_key = format!(
            "tmp/{}/{}",
            self.minter.key_segment(&identifier),
            row.file_name
        );
        info!(source = %uri, staging = %staging_key, "streaming");

        let streamed = source
            .open(&uri.bucket, &uri.key)
            .map_err(storage_failure)
            .and_then(|reader| {
                let mut digesting =
                    DigestingReader::new(reader, self.opts.chunk_size, DigestSelection::ALL);
                self.storage
                    .upload(bucket, &staging_key, &mut digesting, &self.opts)
                    .map_err(storage_failure)?;
                Ok(digesting.finish())
            });
        let result =
            streamed.and_then(|digests| self.promote(row, bucket, &staging_key, identifier, digests));

        if let Err(e) = self.storage.delete(bucket, &staging_key) {
            warn!(bucket, key = %staging_key, error = %e, "could not remove staging object");
        }
        result
    }

    fn promote(
        &self,
        row: &ManifestRow,
        bucket: &str,
        staging_key: &str,
        identifier: Identifier,
        digests: Digests,
    ) -> Result<Landed, RowFailure> {
        let digest = self.computed_digest(&digests)?;
        let lock = self.locks.get(bucket, &digest);
        let _held = lock.hold();
        if let Some(found) = self.find_existing(bucket, &digest)? {
            return Ok(Landed::dedup(found, Some(identifier), Some(digests)));
        }

        let key = self.content_key(&digest, &identifier, &row.file_name);
        let staged = ObjectUri::new(self.provider, bucket, staging_key);
        self.storage
            .copy_from(&staged, bucket, &key)
            .map_err(storage_failure)?;
        Ok(Landed {
            key,
            outcome: TransferOutcome::Streamed,
            identifier: Some(identifier),
            digests: Some(digests),
        })
    }

    fn finish(
        &self,
        id: RowId,
        row: &ManifestRow,
        bucket: &str,
        landed: Landed,
    ) -> Result<TransferOutcome, RowFailure> {
        let Landed {
            key,
            outcome,
            identifier,
            digests,
        } = landed;
        let path = format!("{}://{bucket}/{key}", self.provider.scheme());
        let desc = self
            .storage
            .describe(bucket, &key)
            .map_err(storage_failure)?
            .ok_or_else(|| RowFailure::TransferIo(format!("{path} missing after transfer")))?;

        if outcome.created_object() {
            if let Err(failure) = self.verify(row, digests.as_ref(), &path, &desc) {
                if self.cfg.strict_integrity {
                    if let Err(e) = self.storage.delete(bucket, &key) {
                        warn!(%path, error = %e, "could not remove unverified object");
                    }
                    error!(%path, error = %failure, "integrity check failed");
                    return Err(failure);
                }
                warn!(%path, error = %failure, "integrity check failed; keeping object");
            }
        }

        let identifier = match (&row.identifier, outcome) {
            (Some(existing), _) => existing.clone(),
            (None, TransferOutcome::Deduplicated) => self
                .minter
                .derive(&path)
                .or(identifier)
                .unwrap_or_else(|| self.minter.mint()),
            (None, _) => identifier.unwrap_or_else(|| self.minter.mint()),
        };
        if let Some(crc) = digests.as_ref().and_then(|d| d.crc32c) {
            self.crc_index.record(&row.input_file_path, crc);
        }

        let provider = self.provider;
        self.store
            .update(id, |r| {
                if let Some(d) = &digests {
                    merge_digests(r, d);
                    // The destination's native digest is the one just computed.
                    match provider {
                        Provider::Aws if d.multipart_tag.is_some() => {
                            r.aws_tag = d.multipart_tag.clone()
                        }
                        Provider::Gcs if d.crc32c.is_some() => r.gcs_crc32c = d.crc32c_base64(),
                        _ => {}
                    }
                }
                r.source_size.get_or_insert(desc.size);
                r.identifier.get_or_insert(identifier);
                r.set_destination(
                    provider,
                    Destination {
                        path: path.clone(),
                        modified: desc.last_modified.clone(),
                        size: desc.size,
                    },
                );
            })
            .map_err(io_failure)?;
        self.store.persist().map_err(io_failure)?;

        info!(%path, outcome = outcome.as_str(), size = desc.size, "transferred");
        Ok(outcome)
    }

    /// Compare what the provider reports against what was computed.
    fn verify(
        &self,
        row: &ManifestRow,
        digests: Option<&Digests>,
        path: &str,
        desc: &ObjectDescription,
    ) -> Result<(), RowFailure> {
        let mismatch = |expected: String, reported: String| RowFailure::IntegrityMismatch {
            path: path.to_string(),
            expected,
            reported,
        };
        let md5 = digests
            .and_then(|d| d.md5.clone())
            .or_else(|| row.content_md5.clone());

        match self.provider {
            Provider::Aws => {
                let Some(reported) = desc.e_tag.as_deref() else {
                    debug!(%path, "provider reported no entity tag");
                    return Ok(());
                };
                let tag = digests
                    .and_then(|d| d.multipart_tag.clone())
                    .or_else(|| row.aws_tag.clone());
                // Plain tags are content MD5s; multipart tags only compare to multipart tags.
                let expected = if is_plain_md5(reported) {
                    md5.or_else(|| tag.filter(|t| is_plain_md5(t)))
                } else {
                    tag.filter(|t| !is_plain_md5(t))
                };
                match expected {
                    Some(expected) if expected != reported => {
                        Err(mismatch(expected, reported.to_string()))
                    }
                    _ => Ok(()),
                }
            }
            Provider::Gcs => {
                let crc = digests
                    .and_then(|d| d.crc32c)
                    .or_else(|| self.crc_index.get(&row.input_file_path));
                if let (Some(expected), Some(reported)) = (crc, desc.crc32c) {
                    if expected != reported {
                        return Err(mismatch(
                            crc32c_to_base64(expected),
                            crc32c_to_base64(reported),
                        ));
                    }
                    return Ok(());
                }
                if let (Some(expected), Some(reported)) = (md5, desc.md5.as_deref()) {
                    if expected != reported {
                        return Err(mismatch(expected, reported.to_string()));
                    }
                }
                Ok(())
            }
        }
    }
}

fn io_failure(err: ingest_io::Error) -> RowFailure {
    RowFailure::TransferIo(err.to_string())
}

fn storage_failure(err: ingest_io::Error) -> RowFailure {
    match &err {
        ingest_io::Error::NotFound(_) => RowFailure::SourceUnavailable(err.to_string()),
        ingest_io::Error::Io(e)
            if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ) =>
        {
            RowFailure::SourceUnavailable(err.to_string())
        }
        _ => RowFailure::TransferIo(err.to_string()),
    }
}

fn digest_failure(path: &Path, err: DigestError) -> RowFailure {
    match err {
        DigestError::Unavailable(e) => {
            RowFailure::SourceUnavailable(format!("{}: {e}", path.display()))
        }
        other => RowFailure::TransferIo(format!("{}: {other}", path.display())),
    }
}
