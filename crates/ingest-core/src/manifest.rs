//! Manifest rows and column schema.
//!
//! A manifest is a header plus one row per file. Columns the engine manages are
//! typed fields on [`ManifestRow`]; any other input column passes through
//! untouched in `extra`. Every computed field is an `Option`: `None` means "not
//! yet computed", and a destination is either complete or absent.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::Identifier;
use crate::location::{basename, Provider};

/// Which column family a manifest carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Standard,
    /// DICOM slices grouped into stacks with synthesized volume rows.
    Imaging,
}

/// Columns owned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    StudyId,
    ConsentGroup,
    InputFilePath,
    FileName,
    InputFileSize,
    Guid,
    DrsUri,
    Md5,
    GsCrc32c,
    GsPath,
    GsModified,
    GsSize,
    S3Tag,
    S3Path,
    S3Modified,
    S3Size,
    FileType,
    DicomStack,
}

impl Field {
    /// Canonical order, used when appending columns missing from the input.
    pub const STANDARD: [Field; 16] = [
        Field::StudyId,
        Field::ConsentGroup,
        Field::InputFilePath,
        Field::FileName,
        Field::InputFileSize,
        Field::Guid,
        Field::DrsUri,
        Field::Md5,
        Field::GsCrc32c,
        Field::GsPath,
        Field::GsModified,
        Field::GsSize,
        Field::S3Tag,
        Field::S3Path,
        Field::S3Modified,
        Field::S3Size,
    ];

    pub const IMAGING: [Field; 2] = [Field::FileType, Field::DicomStack];

    pub fn name(self) -> &'static str {
        match self {
            Field::StudyId => "study_id",
            Field::ConsentGroup => "consent_group",
            Field::InputFilePath => "input_file_path",
            Field::FileName => "file_name",
            Field::InputFileSize => "input_file_size",
            Field::Guid => "guid",
            Field::DrsUri => "ga4gh_drs_uri",
            Field::Md5 => "md5sum",
            Field::GsCrc32c => "gs_crc32c",
            Field::GsPath => "gs_path",
            Field::GsModified => "gs_modified_date",
            Field::GsSize => "gs_file_size",
            Field::S3Tag => "s3_md5sum",
            Field::S3Path => "s3_path",
            Field::S3Modified => "s3_modified_date",
            Field::S3Size => "s3_file_size",
            Field::FileType => "file_type",
            Field::DicomStack => "dicom_stack",
        }
    }

    /// Managed fields of a variant, in canonical order.
    pub fn for_variant(variant: Variant) -> Vec<Field> {
        let mut fields = Field::STANDARD.to_vec();
        if variant == Variant::Imaging {
            fields.extend(Field::IMAGING);
        }
        fields
    }

    pub fn from_name(name: &str, variant: Variant) -> Option<Field> {
        Field::for_variant(variant)
            .into_iter()
            .find(|f| f.name() == name)
    }

    /// Columns a run clears when not resuming.
    fn is_computed(self) -> bool {
        !matches!(
            self,
            Field::StudyId
                | Field::ConsentGroup
                | Field::InputFilePath
                | Field::FileName
                | Field::FileType
                | Field::DicomStack
        )
    }
}

/// Scalar imaging attributes carried by the imaging variant.
pub const IMAGING_ATTRIBUTES: [&str; 10] = [
    "participant_id",
    "SeriesDescription",
    "StudyInstanceUID",
    "SeriesInstanceUID",
    "StudyDate",
    "ConvolutionKernel",
    "Manufacturer",
    "ManufacturerModelName",
    "SliceThickness",
    "ReconstructionDiameter",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    Field(Field),
    Attribute(String),
    Extra(String),
}

impl Column {
    pub fn name(&self) -> &str {
        match self {
            Column::Field(f) => f.name(),
            Column::Attribute(name) | Column::Extra(name) => name,
        }
    }
}

/// Ordered column layout of one manifest file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSchema {
    variant: Variant,
    columns: Vec<Column>,
}

impl ManifestSchema {
    /// Canonical layout with no passthrough columns.
    pub fn new(variant: Variant) -> Self {
        let mut schema = Self {
            variant,
            columns: Vec::new(),
        };
        schema.append_missing();
        schema
    }

    /// Layout for an existing header: input columns keep their position, managed
    /// columns that are missing are appended in canonical order.
    pub fn from_header<S: AsRef<str>>(header: &[S], variant: Variant) -> Result<Self> {
        let mut columns = Vec::with_capacity(header.len());
        for name in header.iter().map(AsRef::as_ref) {
            let column = if let Some(field) = Field::from_name(name, variant) {
                Column::Field(field)
            } else if variant == Variant::Imaging && IMAGING_ATTRIBUTES.contains(&name) {
                Column::Attribute(name.to_string())
            } else {
                Column::Extra(name.to_string())
            };
            if columns.contains(&column) {
                return Err(Error::Manifest(format!("duplicate column '{name}'")));
            }
            columns.push(column);
        }
        for required in [Field::StudyId, Field::InputFilePath] {
            if !columns.contains(&Column::Field(required)) {
                return Err(Error::Manifest(format!(
                    "missing required column '{}'",
                    required.name()
                )));
            }
        }
        let mut schema = Self { variant, columns };
        schema.append_missing();
        Ok(schema)
    }

    fn append_missing(&mut self) {
        let mut wanted: Vec<Column> = Field::for_variant(self.variant)
            .into_iter()
            .map(Column::Field)
            .collect();
        if self.variant == Variant::Imaging {
            wanted.extend(IMAGING_ATTRIBUTES.iter().map(|a| Column::Attribute(a.to_string())));
        }
        for column in wanted {
            if !self.columns.contains(&column) {
                self.columns.push(column);
            }
        }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn header(&self) -> Vec<&str> {
        self.columns.iter().map(Column::name).collect()
    }
}

/// Stable identity of a row across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub study_id: String,
    pub input_file_path: String,
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.study_id, self.input_file_path)
    }
}

/// Where a row landed on one provider. All three parts or nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub path: String,
    pub modified: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManifestRow {
    pub study_id: String,
    pub consent_group: String,
    pub input_file_path: String,
    pub file_name: String,
    pub source_size: Option<u64>,
    pub identifier: Option<Identifier>,
    pub content_md5: Option<String>,
    /// Base64 CRC32C.
    pub gcs_crc32c: Option<String>,
    /// S3 entity tag: plain MD5 or `hex-N`.
    pub aws_tag: Option<String>,
    pub gcs: Option<Destination>,
    pub aws: Option<Destination>,
    pub file_type: Option<String>,
    pub stack_id: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub extra: BTreeMap<String, String>,
}

/// A row plus the providers whose half-filled destination was discarded on load.
#[derive(Debug)]
pub struct ParsedRow {
    pub row: ManifestRow,
    pub discarded: Vec<Provider>,
}

impl ManifestRow {
    pub fn new(study_id: impl Into<String>, input_file_path: impl Into<String>) -> Self {
        let input_file_path = input_file_path.into();
        Self {
            study_id: study_id.into(),
            file_name: basename(&input_file_path).to_string(),
            input_file_path,
            ..Default::default()
        }
    }

    pub fn key(&self) -> RowKey {
        RowKey {
            study_id: self.study_id.clone(),
            input_file_path: self.input_file_path.clone(),
        }
    }

    pub fn destination(&self, provider: Provider) -> Option<&Destination> {
        match provider {
            Provider::Aws => self.aws.as_ref(),
            Provider::Gcs => self.gcs.as_ref(),
        }
    }

    pub fn set_destination(&mut self, provider: Provider, destination: Destination) {
        match provider {
            Provider::Aws => self.aws = Some(destination),
            Provider::Gcs => self.gcs = Some(destination),
        }
    }

    /// The provider-native digest as stored in the manifest.
    pub fn native_digest(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Aws => self.aws_tag.as_deref(),
            Provider::Gcs => self.gcs_crc32c.as_deref(),
        }
    }

    /// Reset everything a run computes, keeping identity and passthrough data.
    pub fn clear_computed(&mut self) {
        self.source_size = None;
        self.identifier = None;
        self.content_md5 = None;
        self.gcs_crc32c = None;
        self.aws_tag = None;
        self.gcs = None;
        self.aws = None;
    }

    pub fn from_cells<S: AsRef<str>>(schema: &ManifestSchema, cells: &[S]) -> Result<ParsedRow> {
        if cells.len() != schema.width() {
            return Err(Error::Manifest(format!(
                "row has {} cells, header has {}",
                cells.len(),
                schema.width()
            )));
        }
        let mut row = ManifestRow::default();
        let mut guid = None;
        let mut uri = None;
        let mut gcs = PartialDestination::default();
        let mut aws = PartialDestination::default();

        for (column, cell) in schema.columns().iter().zip(cells) {
            let cell = cell.as_ref();
            let value = non_empty(cell);
            match column {
                Column::Extra(name) => {
                    row.extra.insert(name.clone(), cell.to_string());
                }
                Column::Attribute(name) => {
                    if let Some(v) = value {
                        row.attributes.insert(name.clone(), v);
                    }
                }
                Column::Field(field) => match field {
                    Field::StudyId => row.study_id = cell.to_string(),
                    Field::ConsentGroup => row.consent_group = cell.to_string(),
                    Field::InputFilePath => row.input_file_path = cell.to_string(),
                    Field::FileName => row.file_name = cell.to_string(),
                    Field::InputFileSize => row.source_size = parse_size(*field, cell)?,
                    Field::Guid => guid = value,
                    Field::DrsUri => uri = value,
                    Field::Md5 => row.content_md5 = value,
                    Field::GsCrc32c => row.gcs_crc32c = value,
                    Field::S3Tag => row.aws_tag = value,
                    Field::GsPath => gcs.path = value,
                    Field::GsModified => gcs.modified = value,
                    Field::GsSize => gcs.size = value,
                    Field::S3Path => aws.path = value,
                    Field::S3Modified => aws.modified = value,
                    Field::S3Size => aws.size = value,
                    Field::FileType => row.file_type = value,
                    Field::DicomStack => row.stack_id = value,
                },
            }
        }

        if row.study_id.is_empty() || row.input_file_path.is_empty() {
            return Err(Error::Manifest(
                "row is missing study_id or input_file_path".into(),
            ));
        }
        if row.file_name.is_empty() {
            row.file_name = basename(&row.input_file_path).to_string();
        }
        if let Some(guid) = guid {
            row.identifier = Some(Identifier {
                guid,
                uri: uri.unwrap_or_default(),
            });
        }

        let mut discarded = Vec::new();
        for (provider, partial) in [(Provider::Gcs, gcs), (Provider::Aws, aws)] {
            match partial.complete() {
                Ok(Some(dest)) => row.set_destination(provider, dest),
                Ok(None) => {}
                Err(()) => discarded.push(provider),
            }
        }
        Ok(ParsedRow { row, discarded })
    }

    pub fn to_cells(&self, schema: &ManifestSchema) -> Vec<String> {
        schema
            .columns()
            .iter()
            .map(|column| match column {
                Column::Extra(name) => self.extra.get(name).cloned().unwrap_or_default(),
                Column::Attribute(name) => self.attributes.get(name).cloned().unwrap_or_default(),
                Column::Field(field) => self.field_cell(*field),
            })
            .collect()
    }

    fn field_cell(&self, field: Field) -> String {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        let dest = |p: Provider, f: fn(&Destination) -> String| {
            self.destination(p).map(f).unwrap_or_default()
        };
        match field {
            Field::StudyId => self.study_id.clone(),
            Field::ConsentGroup => self.consent_group.clone(),
            Field::InputFilePath => self.input_file_path.clone(),
            Field::FileName => self.file_name.clone(),
            Field::InputFileSize => self.source_size.map(|s| s.to_string()).unwrap_or_default(),
            Field::Guid => self
                .identifier
                .as_ref()
                .map(|i| i.guid.clone())
                .unwrap_or_default(),
            Field::DrsUri => self
                .identifier
                .as_ref()
                .map(|i| i.uri.clone())
                .unwrap_or_default(),
            Field::Md5 => opt(&self.content_md5),
            Field::GsCrc32c => opt(&self.gcs_crc32c),
            Field::S3Tag => opt(&self.aws_tag),
            Field::GsPath => dest(Provider::Gcs, |d| d.path.clone()),
            Field::GsModified => dest(Provider::Gcs, |d| d.modified.clone()),
            Field::GsSize => dest(Provider::Gcs, |d| d.size.to_string()),
            Field::S3Path => dest(Provider::Aws, |d| d.path.clone()),
            Field::S3Modified => dest(Provider::Aws, |d| d.modified.clone()),
            Field::S3Size => dest(Provider::Aws, |d| d.size.to_string()),
            Field::FileType => opt(&self.file_type),
            Field::DicomStack => opt(&self.stack_id),
        }
    }
}

/// True for managed columns that a fresh (non-resume) run recomputes.
pub fn is_computed_column(column: &Column) -> bool {
    matches!(column, Column::Field(f) if f.is_computed())
}

#[derive(Default)]
struct PartialDestination {
    path: Option<String>,
    modified: Option<String>,
    size: Option<String>,
}

impl PartialDestination {
    fn complete(self) -> std::result::Result<Option<Destination>, ()> {
        match (self.path, self.modified, self.size) {
            (None, None, None) => Ok(None),
            (Some(path), Some(modified), Some(size)) => match size.parse::<u64>() {
                Ok(size) => Ok(Some(Destination {
                    path,
                    modified,
                    size,
                })),
                Err(_) => Err(()),
            },
            _ => Err(()),
        }
    }
}

fn non_empty(cell: &str) -> Option<String> {
    let trimmed = cell.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_size(field: Field, cell: &str) -> Result<Option<u64>> {
    match non_empty(cell) {
        None => Ok(None),
        Some(v) => v.parse::<u64>().map(Some).map_err(|_| {
            Error::Manifest(format!("column '{}' is not a size: '{v}'", field.name()))
        }),
    }
}
