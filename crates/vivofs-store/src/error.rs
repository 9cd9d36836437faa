//! Error types for the durable store boundary.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error variants for durable store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists under the requested key.
    #[error("no record for key {key_hex}")]
    KeyNotFound {
        /// Hex rendering of the missing key.
        key_hex: String,
    },

    /// The store context has already been closed.
    #[error("store context is closed")]
    Closed,

    /// A record could not be decoded.
    #[error("corrupt record under key {key_hex}: {reason}")]
    CorruptRecord {
        /// Hex rendering of the affected key.
        key_hex: String,
        /// Description of the decode failure.
        reason: String,
    },

    /// The flush to stable media failed.
    #[error("flush failed: {reason}")]
    FlushFailed {
        /// Description of the failure.
        reason: String,
    },

    /// Wraps lower-level I/O errors from disk-backed implementations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Renders a store key as lowercase hex for diagnostics.
pub fn key_hex(key: &[u8]) -> String {
    key.iter().map(|b| format!("{b:02x}")).collect()
}
