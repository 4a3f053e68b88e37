//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures of a [`StorageBackend`](crate::StorageBackend).
#[derive(Debug, Error)]
pub enum StorageError {
    /// The operating system refused a file operation.
    #[error("storage I/O failed: {0}")]
    Io(#[from] io::Error),

    /// A read reached past the stored bytes.
    #[error("cannot read {len} bytes at offset {offset}, store holds {size}")]
    ReadPastEnd {
        /// Start of the read.
        offset: u64,
        /// Bytes requested.
        len: usize,
        /// Bytes stored.
        size: u64,
    },

    /// A truncate asked to grow the store.
    #[error("cannot truncate to {requested} bytes, storage holds {size}")]
    InvalidTruncate {
        /// Size asked for.
        requested: u64,
        /// Bytes stored.
        size: u64,
    },

    /// The content is too large to be addressed in memory.
    #[error("storage of {size} bytes cannot be read into memory")]
    TooLarge {
        /// The size in bytes.
        size: u64,
    },
}
