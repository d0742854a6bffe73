//! Storage error types.

use quorum_core::Index;
use thiserror::Error;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error during a storage operation.
    #[error("I/O error during {operation}: {source}")]
    Io {
        /// The operation that failed.
        operation: &'static str,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Stored data failed validation.
    #[error("corrupt store: {reason}")]
    Corrupt {
        /// Description of the corruption.
        reason: String,
    },

    /// Stored data does not match its checksum.
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Expected checksum value.
        expected: u32,
        /// Actual checksum value.
        actual: u32,
    },

    /// An entry was requested at an index the log does not hold.
    #[error("no entry at index {index}")]
    NotFound {
        /// The missing index.
        index: Index,
    },

    /// A snapshot writer was used after completion.
    #[error("snapshot at index {index} is already complete")]
    SnapshotComplete {
        /// The snapshot index.
        index: Index,
    },
}

impl StoreError {
    pub(crate) fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }
}
