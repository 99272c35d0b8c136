#![forbid(unsafe_code)]
//! ingest-core: shared vocabulary for the transfer engine.
//!
//! Holds the pieces every other crate agrees on: the manifest row model and its
//! column schema, provider-native digest algorithms, object locations, identifier
//! minting, configuration and the error taxonomy. Nothing here performs network
//! or filesystem I/O; digests run over any `std::io::Read`.

pub mod config;
pub mod digest;
pub mod error;
pub mod id;
pub mod location;
pub mod manifest;
pub mod prelude;

/// Engine version string, stamped into logs and receipts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
