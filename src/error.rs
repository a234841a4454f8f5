//! Error types for the xref scanning engine.
//!
//! Errors are split by blast radius: [`DecodeError`] is per method and never
//! escapes the graph builder, while [`ScanError`] covers failures that abort a
//! whole scan session (or indicate a programming mistake).

use std::path::PathBuf;
use thiserror::Error;

use crate::core::address::AddressKind;
pub use crate::core::decoder::DecodeError;

/// Main error type for scan sessions.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The native image could not be opened or mapped.
    #[error("Cannot map native image {path:?}: {source}")]
    MissingBaseImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An address from one coordinate space was used where another was expected.
    #[error("Address space mismatch: expected {expected:?}, found {found:?}")]
    InconsistentAddressSpace {
        expected: AddressKind,
        found: AddressKind,
    },

    /// Instruction decoding failed
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The scan was cancelled between method work units
    #[error("Scan cancelled")]
    Cancelled,

    /// Architecture not supported
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Scan cache errors
    #[error("Scan cache error: {0}")]
    Cache(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for scan operations
pub type Result<T> = std::result::Result<T, ScanError>;

/// Macro for logging and returning errors
#[macro_export]
macro_rules! log_error {
    ($err:expr) => {{
        let e = $err;
        tracing::error!(error = %e, "Operation failed");
        e
    }};
    ($err:expr, $msg:expr) => {{
        let e = $err;
        tracing::error!(error = %e, message = $msg, "Operation failed");
        e
    }};
}
