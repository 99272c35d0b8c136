//! The manifest store: ordered rows in memory, one durable file on disk.
//!
//! Workers mutate rows in place (one row per worker) through [`ManifestStore::update`]
//! and then call [`ManifestStore::persist`], which truncates the file and rewrites
//! the complete snapshot under a single mutex. Lock order is always
//! file -> row list -> individual row; `update` never holds a row lock while
//! persisting.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use ingest_core::id::RowId;
use ingest_core::manifest::{ManifestRow, ManifestSchema, RowKey};
use tracing::debug;

use crate::error::{Error, Result};
use crate::tsv;

type SharedRow = Arc<Mutex<ManifestRow>>;

pub struct ManifestStore {
    path: PathBuf,
    schema: ManifestSchema,
    rows: RwLock<Vec<SharedRow>>,
    index: RwLock<HashMap<RowKey, RowId>>,
    file: Mutex<File>,
    persists: AtomicU64,
    write_delay: Option<Duration>,
}

impl ManifestStore {
    /// Create (or truncate) the manifest file and take ownership of `rows`.
    /// Fails on duplicate row identities.
    pub fn create<P: AsRef<Path>>(
        path: P,
        schema: ManifestSchema,
        rows: Vec<ManifestRow>,
    ) -> Result<Self> {
        let mut index = HashMap::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            if index.insert(row.key(), RowId::new(i as u64)).is_some() {
                return Err(Error::Config(format!("duplicate row identity {}", row.key())));
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            schema,
            rows: RwLock::new(rows.into_iter().map(|r| Arc::new(Mutex::new(r))).collect()),
            index: RwLock::new(index),
            file: Mutex::new(file),
            persists: AtomicU64::new(0),
            write_delay: None,
        })
    }

    /// Sleep inside the persist critical section, between truncate and write.
    /// Widens race windows in tests.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &ManifestSchema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<RowId> {
        (0..self.len() as u64).map(RowId::new).collect()
    }

    pub fn find(&self, key: &RowKey) -> Option<RowId> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    fn shared(&self, id: RowId) -> Result<SharedRow> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.index())
            .cloned()
            .ok_or_else(|| Error::Storage(format!("no row {id}")))
    }

    /// Clone of the current row state.
    pub fn get(&self, id: RowId) -> Result<ManifestRow> {
        let row = self.shared(id)?;
        let guard = row.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.clone())
    }

    /// Mutate one row in place.
    pub fn update<T>(&self, id: RowId, f: impl FnOnce(&mut ManifestRow) -> T) -> Result<T> {
        let row = self.shared(id)?;
        let mut guard = row.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut guard))
    }

    /// Append a row created during the run. Rejects duplicate identities.
    pub fn push(&self, row: ManifestRow) -> Result<RowId> {
        let key = row.key();
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if index.contains_key(&key) {
            return Err(Error::Config(format!("duplicate row identity {key}")));
        }
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let id = RowId::new(rows.len() as u64);
        rows.push(Arc::new(Mutex::new(row)));
        index.insert(key, id);
        Ok(id)
    }

    pub fn snapshot(&self) -> Vec<ManifestRow> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.iter()
            .map(|r| r.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect()
    }

    /// Number of completed `persist` calls.
    pub fn persist_count(&self) -> u64 {
        self.persists.load(Ordering::Relaxed)
    }

    /// Rewrite the whole manifest from position zero. Serialized: no two
    /// callers ever share one seek/truncate/write cycle.
    pub fn persist(&self) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.snapshot();

        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }
        {
            let mut out = BufWriter::new(&mut *file);
            tsv::write_manifest(&mut out, &self.schema, &snapshot)?;
            out.flush()?;
        }
        file.sync_data()?;

        let n = self.persists.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(rows = snapshot.len(), persist = n, path = %self.path.display(), "manifest persisted");
        Ok(())
    }
}
