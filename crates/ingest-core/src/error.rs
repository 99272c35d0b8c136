use thiserror::Error;

/// Canonical result for core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Digest error: {0}")]
    Digest(String),

    #[error("Invalid object location: {0}")]
    Location(String),

    #[error("Internal invariant failed: {0}")]
    Invariant(String),
}

/// Why a single row failed. Row failures never abort a run; the row's
/// destination stays empty and the next resume picks it up again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowFailure {
    /// Local file unreadable or remote object missing.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("bucket not writable: {0}")]
    AuthorizationDenied(String),

    /// Network/API or stream failure while moving bytes.
    #[error("transfer failed: {0}")]
    TransferIo(String),

    #[error("integrity mismatch on {path}: expected {expected}, provider reported {reported}")]
    IntegrityMismatch {
        path: String,
        expected: String,
        reported: String,
    },
}

impl RowFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            RowFailure::SourceUnavailable(_) => "source_unavailable",
            RowFailure::AuthorizationDenied(_) => "authorization_denied",
            RowFailure::TransferIo(_) => "transfer_io",
            RowFailure::IntegrityMismatch { .. } => "integrity_mismatch",
        }
    }
}
