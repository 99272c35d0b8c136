//! Checksum phase: one streaming pass per local source computing every digest
//! still missing for the run's targets.

use std::path::PathBuf;

use ingest_core::config::Targets;
use ingest_core::digest::{Crc32cIndex, DigestError, DigestSelection, Digests};
use ingest_core::error::RowFailure;
use ingest_core::id::RowId;
use ingest_core::location::Source;
use ingest_core::manifest::ManifestRow;
use ingest_io::buf::digest_path;
use ingest_io::ManifestStore;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumOutcome {
    Computed { bytes: u64 },
    AlreadyPresent,
    /// Remote sources are described during validation instead.
    Remote,
}

/// Digests a row still needs.
pub fn missing_digests(row: &ManifestRow, targets: Targets) -> DigestSelection {
    DigestSelection {
        md5: row.content_md5.is_none(),
        multipart_tag: targets.aws && row.aws_tag.is_none(),
        crc32c: targets.gcs && row.gcs_crc32c.is_none(),
    }
}

/// Fill the digest fields of `row` that are still empty.
pub fn merge_digests(row: &mut ManifestRow, digests: &Digests) {
    if row.content_md5.is_none() {
        row.content_md5 = digests.md5.clone();
    }
    if row.aws_tag.is_none() {
        row.aws_tag = digests.multipart_tag.clone();
    }
    if row.gcs_crc32c.is_none() {
        row.gcs_crc32c = digests.crc32c_base64();
    }
    if row.source_size.is_none() {
        row.source_size = Some(digests.bytes);
    }
}

pub struct ChecksumPhase<'a> {
    store: &'a ManifestStore,
    targets: Targets,
    chunk_size: usize,
    source_root: Option<PathBuf>,
    crc_index: &'a Crc32cIndex,
}

impl<'a> ChecksumPhase<'a> {
    pub fn new(
        store: &'a ManifestStore,
        targets: Targets,
        chunk_size: usize,
        source_root: Option<PathBuf>,
        crc_index: &'a Crc32cIndex,
    ) -> Self {
        Self {
            store,
            targets,
            chunk_size,
            source_root,
            crc_index,
        }
    }

    pub fn checksum_row(&self, id: RowId) -> Result<ChecksumOutcome, RowFailure> {
        let row = self
            .store
            .get(id)
            .map_err(|e| RowFailure::TransferIo(e.to_string()))?;
        if let Some(encoded) = &row.gcs_crc32c {
            // Keep the integer cache complete for rows checksummed earlier.
            if self.crc_index.get(&row.input_file_path).is_none() {
                self.crc_index
                    .record_base64(&row.input_file_path, encoded)
                    .map_err(|e| RowFailure::TransferIo(e.to_string()))?;
            }
        }

        let path = match Source::classify(&row.input_file_path, self.source_root.as_deref())
            .map_err(|e| RowFailure::SourceUnavailable(e.to_string()))?
        {
            Source::Local(path) => path,
            Source::Remote(_) => return Ok(ChecksumOutcome::Remote),
        };

        let selection = missing_digests(&row, self.targets);
        if selection.is_empty() {
            debug!(row = %row.key(), "digests already present");
            return Ok(ChecksumOutcome::AlreadyPresent);
        }

        let digests = digest_path(&path, self.chunk_size, selection).map_err(|e| match e {
            DigestError::Unavailable(source) => {
                RowFailure::SourceUnavailable(format!("{}: {source}", path.display()))
            }
            DigestError::Interrupted { bytes_read, source } => RowFailure::TransferIo(format!(
                "{}: read failed after {bytes_read} bytes: {source}",
                path.display()
            )),
        })?;

        if let Some(crc) = digests.crc32c {
            self.crc_index.record(&row.input_file_path, crc);
        }
        self.store
            .update(id, |r| merge_digests(r, &digests))
            .map_err(|e| RowFailure::TransferIo(e.to_string()))?;
        self.store
            .persist()
            .map_err(|e| RowFailure::TransferIo(e.to_string()))?;

        info!(
            file = %path.display(),
            bytes = digests.bytes,
            md5 = digests.md5.as_deref().unwrap_or(""),
            tag = digests.multipart_tag.as_deref().unwrap_or(""),
            "checksummed"
        );
        Ok(ChecksumOutcome::Computed {
            bytes: digests.bytes,
        })
    }
}
