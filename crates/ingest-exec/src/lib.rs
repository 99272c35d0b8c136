#![forbid(unsafe_code)]
//! ingest-exec: the run engine.
//!
//! A run validates every row up front, creates the receipt manifest, computes
//! checksums for local sources and then transfers each row to every target
//! provider. Row failures are collected per phase and never abort siblings;
//! the manifest on disk is rewritten after every checksum and transfer.

pub mod capability;
pub mod checksum;
pub mod imaging;
pub mod interrupt;
pub mod metrics;
pub mod receipt;
pub mod runtime;
pub mod scheduler;
pub mod transfer;
pub mod validate;

pub use runtime::{Engine, ExecError, FailedRow, RunInput, RunOutcome, RunReport, ShutdownHook};
