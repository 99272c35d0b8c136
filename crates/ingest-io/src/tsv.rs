//! Tab-separated manifest codec.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use ingest_core::location::Provider;
use ingest_core::manifest::{ManifestRow, ManifestSchema, Variant};
use tracing::warn;

use crate::error::{Error, Result};

fn reader_builder() -> csv::ReaderBuilder {
    let mut builder = csv::ReaderBuilder::new();
    builder.delimiter(b'\t').has_headers(true);
    builder
}

fn writer_builder() -> csv::WriterBuilder {
    let mut builder = csv::WriterBuilder::new();
    builder
        .delimiter(b'\t')
        .terminator(csv::Terminator::Any(b'\n'));
    builder
}

/// A manifest as loaded from disk.
#[derive(Debug)]
pub struct LoadedManifest {
    pub schema: ManifestSchema,
    pub rows: Vec<ManifestRow>,
    /// Rows (by position) whose half-filled destination was dropped.
    pub repaired: Vec<(usize, Provider)>,
}

pub fn read_manifest_from<R: Read>(input: R, variant: Variant) -> Result<LoadedManifest> {
    let mut reader = reader_builder().from_reader(input);
    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let schema = ManifestSchema::from_header(&header, variant)?;

    let mut rows = Vec::new();
    let mut repaired = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        // Appended managed columns have no cells in the input yet.
        let mut cells: Vec<&str> = record.iter().collect();
        cells.resize(schema.width(), "");
        let parsed = ManifestRow::from_cells(&schema, &cells)
            .map_err(|e| Error::Config(format!("manifest line {}: {e}", index + 2)))?;
        for provider in &parsed.discarded {
            warn!(
                row = %parsed.row.key(),
                provider = %provider,
                "discarding half-filled destination; the row will be transferred again"
            );
            repaired.push((index, *provider));
        }
        rows.push(parsed.row);
    }
    Ok(LoadedManifest {
        schema,
        rows,
        repaired,
    })
}

pub fn read_manifest<P: AsRef<Path>>(path: P, variant: Variant) -> Result<LoadedManifest> {
    let file = File::open(path.as_ref()).map_err(|e| {
        Error::Config(format!("cannot open manifest {}: {e}", path.as_ref().display()))
    })?;
    read_manifest_from(file, variant)
}

/// Write header plus rows. The caller owns flushing of `out`.
pub fn write_manifest<'a, W, I>(out: W, schema: &ManifestSchema, rows: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a ManifestRow>,
{
    let mut writer = writer_builder().from_writer(out);
    writer.write_record(schema.header())?;
    for row in rows {
        writer.write_record(row.to_cells(schema))?;
    }
    writer.flush()?;
    Ok(())
}

/// Split `path` into `path.1`, `path.2`, ... each holding the header and at most
/// `lines` data rows. Cells are copied verbatim.
pub fn split_manifest<P: AsRef<Path>>(path: P, lines: usize) -> Result<Vec<PathBuf>> {
    if lines == 0 {
        return Err(Error::Config("lines per part must be positive".into()));
    }
    let path = path.as_ref();
    let mut reader = reader_builder().from_path(path)?;
    let header = reader.headers()?.clone();

    let mut parts = Vec::new();
    let mut writer: Option<csv::Writer<File>> = None;
    let mut in_part = 0usize;
    for record in reader.records() {
        let record = record?;
        if writer.is_none() || in_part == lines {
            if let Some(mut done) = writer.take() {
                done.flush()?;
            }
            let part_path = PathBuf::from(format!("{}.{}", path.display(), parts.len() + 1));
            let mut next = writer_builder().from_path(&part_path)?;
            next.write_record(&header)?;
            parts.push(part_path);
            writer = Some(next);
            in_part = 0;
        }
        if let Some(w) = writer.as_mut() {
            w.write_record(&record)?;
        }
        in_part += 1;
    }
    if let Some(mut done) = writer {
        done.flush()?;
    }
    Ok(parts)
}
