#![forbid(unsafe_code)]
//! ingest-io: everything that touches bytes.
//!
//! - `tsv`: tab-separated manifest codec (read, write, split).
//! - `manifest_store`: in-memory rows plus the serialized full-rewrite `persist`.
//! - `storage`: the `ObjectStorage` seam, the `object_store` backend (feature
//!   gated) and provider registry.
//! - `memory_storage`: in-process backend reproducing provider-native tags.
//! - `staging`, `buf`, `lister`: local staging files, bounded readers, directory walks.

pub mod buf;
pub mod error;
pub mod lister;
pub mod manifest_store;
pub mod memory_storage;
pub mod staging;
pub mod storage;
pub mod tsv;

pub use error::{Error, Result};
pub use manifest_store::ManifestStore;
pub use memory_storage::MemoryStorage;
pub use storage::{Backends, ObjectDescription, ObjectStorage, UploadOptions};
