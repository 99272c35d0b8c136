//! Imaging variant: DICOM slices are grouped into stacks by directory, each
//! stack is converted into one volume, and the volume plus a one-row metadata
//! table are appended to the manifest as ordinary rows.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use ingest_core::location::Source;
use ingest_core::manifest::{ManifestRow, IMAGING_ATTRIBUTES};
use ingest_io::ManifestStore;
use thiserror::Error;
use tracing::{info, warn};

pub const DICOM: &str = "DICOM";
pub const NIFTI: &str = "NIFTI";
pub const TABLE: &str = "TSV";

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("converter failed: {0}")]
    Converter(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("converter output is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),

    #[error("metadata table: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Manifest(#[from] ingest_io::Error),
}

/// Result of converting one stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertedVolume {
    pub volume_path: PathBuf,
    pub attributes: BTreeMap<String, String>,
}

/// Opaque stack converter: slices in, one volume plus flat metadata out.
pub trait ImagingConverter: Send + Sync {
    fn convert(&self, slices: &[PathBuf], output: &Path) -> Result<ConvertedVolume, ImagingError>;
}

/// Runs `program [args..] OUTPUT SLICE..`. A non-empty stdout must be a JSON
/// object of attributes; non-string values are stored in their JSON form.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
}

impl CommandConverter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

impl ImagingConverter for CommandConverter {
    fn convert(&self, slices: &[PathBuf], output: &Path) -> Result<ConvertedVolume, ImagingError> {
        let out = Command::new(&self.program)
            .args(&self.args)
            .arg(output)
            .args(slices)
            .output()?;
        if !out.status.success() {
            return Err(ImagingError::Converter(format!(
                "{} exited with {}: {}",
                self.program,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&out.stdout);
        let mut attributes = BTreeMap::new();
        if !stdout.trim().is_empty() {
            let values: BTreeMap<String, serde_json::Value> = serde_json::from_str(stdout.trim())?;
            for (name, value) in values {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                attributes.insert(name, value);
            }
        }
        if !output.is_file() {
            return Err(ImagingError::Converter(format!(
                "{} did not produce {}",
                self.program,
                output.display()
            )));
        }
        Ok(ConvertedVolume {
            volume_path: output.to_path_buf(),
            attributes,
        })
    }
}

fn is_dicom(input: &str) -> bool {
    !input.contains("://") && input.to_ascii_lowercase().ends_with(".dcm")
}

/// Mark local `.dcm` rows as DICOM slices and assign their stack (the parent
/// directory). Returns the number of rows newly classified.
pub fn classify_slices(rows: &mut [ManifestRow]) -> usize {
    let mut classified = 0;
    for row in rows.iter_mut() {
        if row.file_type.is_some() || !is_dicom(&row.input_file_path) {
            continue;
        }
        row.file_type = Some(DICOM.to_string());
        let parent = Path::new(&row.input_file_path)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        if parent.is_empty() {
            warn!(file = %row.input_file_path, "DICOM slice outside any directory; not stacked");
        } else {
            row.stack_id = Some(parent);
        }
        classified += 1;
    }
    classified
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackSummary {
    pub converted: usize,
    pub failed: usize,
}

struct PendingStack {
    study_id: String,
    consent_group: String,
    slices: Vec<PathBuf>,
}

fn resolve(input: &str, root: Option<&Path>) -> Option<PathBuf> {
    match Source::classify(input, root) {
        Ok(Source::Local(path)) => Some(path),
        _ => None,
    }
}

/// Convert every stack that has no volume row yet and append the volume and
/// metadata rows. A failing stack is logged and skipped.
pub fn synthesize_stacks(
    store: &ManifestStore,
    converter: &dyn ImagingConverter,
    source_root: Option<&Path>,
) -> Result<StackSummary, ImagingError> {
    let rows = store.snapshot();
    let done: HashSet<&str> = rows
        .iter()
        .filter(|r| r.file_type.as_deref() == Some(NIFTI))
        .filter_map(|r| r.stack_id.as_deref())
        .collect();

    let mut pending: BTreeMap<String, PendingStack> = BTreeMap::new();
    for row in &rows {
        let Some(stack) = row.stack_id.as_deref() else {
            continue;
        };
        if row.file_type.as_deref() != Some(DICOM) || done.contains(stack) {
            continue;
        }
        let Some(path) = resolve(&row.input_file_path, source_root) else {
            continue;
        };
        pending
            .entry(stack.to_string())
            .or_insert_with(|| PendingStack {
                study_id: row.study_id.clone(),
                consent_group: row.consent_group.clone(),
                slices: Vec::new(),
            })
            .slices
            .push(path);
    }

    let mut summary = StackSummary::default();
    for (stack, mut group) in pending {
        group.slices.sort();
        let volume_input = format!("{stack}.nii");
        let table_input = format!("{stack}.tsv");
        let (Some(volume_out), Some(table_out)) = (
            resolve(&volume_input, source_root),
            resolve(&table_input, source_root),
        ) else {
            continue;
        };

        let volume = match converter.convert(&group.slices, &volume_out) {
            Ok(volume) => volume,
            Err(e) => {
                warn!(stack = %stack, error = %e, "stack conversion failed");
                summary.failed += 1;
                continue;
            }
        };
        write_attribute_table(&table_out, &volume.attributes)?;

        let attributes: BTreeMap<String, String> = volume
            .attributes
            .iter()
            .filter(|(name, _)| IMAGING_ATTRIBUTES.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let volume_path = if volume.volume_path == volume_out {
            volume_input
        } else {
            volume.volume_path.display().to_string()
        };

        for (input, file_type) in [(volume_path, NIFTI), (table_input, TABLE)] {
            let mut row = ManifestRow::new(group.study_id.clone(), input);
            row.consent_group = group.consent_group.clone();
            row.file_type = Some(file_type.to_string());
            row.stack_id = Some(stack.clone());
            row.attributes = attributes.clone();
            if store.find(&row.key()).is_none() {
                store.push(row)?;
            }
        }
        info!(stack = %stack, slices = group.slices.len(), "stack converted");
        summary.converted += 1;
    }
    Ok(summary)
}

/// One header line of attribute names and one line of values.
pub fn write_attribute_table(path: &Path, attributes: &BTreeMap<String, String>) -> Result<(), ImagingError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .terminator(csv::Terminator::Any(b'\n'))
        .from_path(path)?;
    writer.write_record(attributes.keys())?;
    writer.write_record(attributes.values())?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::manifest::{ManifestSchema, Variant};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Concatenates slices into the volume and reports fixed attributes.
    struct ConcatConverter {
        calls: AtomicUsize,
    }

    impl ImagingConverter for ConcatConverter {
        fn convert(&self, slices: &[PathBuf], output: &Path) -> Result<ConvertedVolume, ImagingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut bytes = Vec::new();
            for slice in slices {
                bytes.extend(std::fs::read(slice)?);
            }
            std::fs::write(output, bytes)?;
            let attributes = [("Manufacturer", "ACME"), ("SliceThickness", "1.5"), ("Other", "x")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            Ok(ConvertedVolume {
                volume_path: output.to_path_buf(),
                attributes,
            })
        }
    }

    fn slice_rows(dir: &Path) -> Vec<ManifestRow> {
        std::fs::create_dir_all(dir.join("series1")).unwrap();
        let mut rows = Vec::new();
        for i in 0..3 {
            let rel = format!("series1/{i}.dcm");
            std::fs::write(dir.join(&rel), [i as u8]).unwrap();
            let mut row = ManifestRow::new("phs1", rel);
            row.consent_group = "c1".into();
            rows.push(row);
        }
        rows.push(ManifestRow::new("phs1", "notes.txt"));
        rows
    }

    #[test]
    fn slices_are_grouped_by_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows = slice_rows(dir.path());
        assert_eq!(classify_slices(&mut rows), 3);
        assert_eq!(rows[0].stack_id.as_deref(), Some("series1"));
        assert_eq!(rows[0].file_type.as_deref(), Some(DICOM));
        assert!(rows[3].file_type.is_none());
    }

    #[test]
    fn each_stack_gains_volume_and_table_rows_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows = slice_rows(dir.path());
        classify_slices(&mut rows);
        let store = ManifestStore::create(
            dir.path().join("m.tsv"),
            ManifestSchema::new(Variant::Imaging),
            rows,
        )
        .unwrap();
        let converter = ConcatConverter {
            calls: AtomicUsize::new(0),
        };

        let summary = synthesize_stacks(&store, &converter, Some(dir.path())).unwrap();
        assert_eq!(summary, StackSummary { converted: 1, failed: 0 });
        assert_eq!(store.len(), 6);

        let volume = store.get(ingest_core::id::RowId::new(4)).unwrap();
        assert_eq!(volume.input_file_path, "series1.nii");
        assert_eq!(volume.file_type.as_deref(), Some(NIFTI));
        assert_eq!(volume.attributes.get("Manufacturer").map(String::as_str), Some("ACME"));
        assert!(!volume.attributes.contains_key("Other"));
        assert_eq!(std::fs::read(dir.path().join("series1.nii")).unwrap(), vec![0, 1, 2]);

        let table = std::fs::read_to_string(dir.path().join("series1.tsv")).unwrap();
        assert_eq!(table, "Manufacturer\tOther\tSliceThickness\nACME\tx\t1.5\n");

        // Already converted stacks are left alone.
        synthesize_stacks(&store, &converter, Some(dir.path())).unwrap();
        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 6);
    }

    #[test]
    fn command_line_is_split_on_whitespace() {
        let converter = CommandConverter::parse("dcm2vol --compress  -q").unwrap();
        assert_eq!(converter.program, "dcm2vol");
        assert_eq!(converter.args, vec!["--compress", "-q"]);
        assert!(CommandConverter::parse("   ").is_none());
    }
}
