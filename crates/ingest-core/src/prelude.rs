//! Convenient re-exports for downstream crates.

pub use crate::config::{IngestConfig, StorageConfig, Targets};
pub use crate::digest::{Crc32cIndex, DigestSelection, Digests};
pub use crate::error::{Error, Result, RowFailure};
pub use crate::id::{DrsMinter, Identifier, IdentifierMinter, RowId};
pub use crate::location::{ObjectUri, Provider, Source, SourceKind};
pub use crate::manifest::{Destination, ManifestRow, ManifestSchema, RowKey, Variant};
