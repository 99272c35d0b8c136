//! Local staging files for cross-provider transfers.
//!
//! A staged object lives in a `NamedTempFile`; dropping it removes the file, so
//! every exit path of a row cleans up.

use std::io::{Seek, SeekFrom};
use std::path::PathBuf;

use tempfile::NamedTempFile;

use crate::error::Result;
use crate::storage::ObjectStorage;

#[derive(Debug, Clone, Default)]
pub struct StagingArea {
    dir: Option<PathBuf>,
}

impl StagingArea {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn create(&self) -> Result<NamedTempFile> {
        let file = match &self.dir {
            Some(dir) => tempfile::Builder::new()
                .prefix("ingest-stage-")
                .tempfile_in(dir)?,
            None => tempfile::Builder::new().prefix("ingest-stage-").tempfile()?,
        };
        Ok(file)
    }

    /// Download `bucket/key` into a fresh staging file, rewound to the start.
    pub fn download(
        &self,
        storage: &dyn ObjectStorage,
        bucket: &str,
        key: &str,
    ) -> Result<NamedTempFile> {
        let mut staged = self.create()?;
        storage.download_to(bucket, key, staged.as_file_mut())?;
        staged.as_file_mut().seek(SeekFrom::Start(0))?;
        Ok(staged)
    }
}
