//! Error types for the Tessera engine.

use crate::etag::Etag;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tessera_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CBOR (de)serialization error.
    #[error("CBOR error: {message}")]
    Cbor {
        /// Description of the failure.
        message: String,
    },

    /// Optimistic concurrency failure.
    #[error("{message}{}", format_etags(.expected, .actual))]
    Concurrency {
        /// Description of the conflict.
        message: String,
        /// The etag the caller expected.
        expected: Option<Etag>,
        /// The etag actually stored.
        actual: Option<Etag>,
    },

    /// A trigger denied the operation.
    #[error("{operation} vetoed by {trigger} because: {reason}")]
    Veto {
        /// The vetoed operation, upper-cased (`PUT`, `DELETE`, ...).
        operation: String,
        /// The trigger that denied the operation.
        trigger: String,
        /// The reason given by the trigger.
        reason: String,
    },

    /// The index exceeded its failure threshold.
    #[error(
        "index {index} is disabled: {errors} errors out of {attempts} attempts (failure rate {failure_rate:.2})"
    )]
    IndexDisabled {
        /// Index name.
        index: String,
        /// Attempts made.
        attempts: u64,
        /// Failed attempts.
        errors: u64,
        /// `errors / attempts`.
        failure_rate: f64,
    },

    /// No index with the given name.
    #[error("index not found: {name}")]
    IndexNotFound {
        /// Index name.
        name: String,
    },

    /// WAL is corrupted or invalid.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// A snapshot is corrupted or invalid.
    #[error("snapshot corruption: {message}")]
    SnapshotCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Several errors collected while running independent steps.
    #[error("{context}: {}", join_errors(.errors))]
    Aggregate {
        /// What was being done.
        context: String,
        /// Every collected error, in order.
        errors: Vec<CoreError>,
    },

    /// The index definition failed to compile.
    #[error("invalid index definition {name}: {message}")]
    InvalidIndexDefinition {
        /// Index name.
        name: String,
        /// What is wrong.
        message: String,
    },

    /// The query could not be parsed.
    #[error("invalid query: {message}")]
    InvalidQuery {
        /// What is wrong.
        message: String,
    },

    /// A patch command could not be applied.
    #[error("invalid patch: {message}")]
    InvalidPatch {
        /// What is wrong.
        message: String,
    },

    /// A document or attachment key is not acceptable.
    #[error("invalid key {key:?}: {message}")]
    InvalidKey {
        /// The offending key.
        key: String,
        /// What is wrong.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Database is already open or locked.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Invalid database format or version.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },
}

fn format_etags(expected: &Option<Etag>, actual: &Option<Etag>) -> String {
    match (expected, actual) {
        (None, None) => String::new(),
        (e, a) => format!(
            " (expected {}, actual {})",
            e.map_or_else(|| "none".to_string(), |e| e.to_string()),
            a.map_or_else(|| "none".to_string(), |a| a.to_string())
        ),
    }
}

fn join_errors(errors: &[CoreError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CoreError {
    /// Creates a concurrency error without etags.
    pub fn concurrency(message: impl Into<String>) -> Self {
        Self::Concurrency {
            message: message.into(),
            expected: None,
            actual: None,
        }
    }

    /// Creates an etag mismatch error.
    pub fn etag_mismatch(message: impl Into<String>, expected: Etag, actual: Option<Etag>) -> Self {
        Self::Concurrency {
            message: message.into(),
            expected: Some(expected),
            actual,
        }
    }

    /// Creates a veto error.
    pub fn veto(
        operation: impl fmt::Display,
        trigger: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Veto {
            operation: operation.to_string().to_uppercase(),
            trigger: trigger.into(),
            reason: reason.into(),
        }
    }

    /// Creates an index not found error.
    pub fn index_not_found(name: impl Into<String>) -> Self {
        Self::IndexNotFound { name: name.into() }
    }

    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates a snapshot corruption error.
    pub fn snapshot_corruption(message: impl Into<String>) -> Self {
        Self::SnapshotCorruption {
            message: message.into(),
        }
    }

    /// Creates a CBOR error.
    pub fn cbor(message: impl fmt::Display) -> Self {
        Self::Cbor {
            message: message.to_string(),
        }
    }

    /// Creates an invalid index definition error.
    pub fn invalid_index_definition(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidIndexDefinition {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }

    /// Creates an invalid patch error.
    pub fn invalid_patch(message: impl Into<String>) -> Self {
        Self::InvalidPatch {
            message: message.into(),
        }
    }

    /// Creates an invalid key error.
    pub fn invalid_key(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns `true` for errors that may succeed when retried after
    /// re-reading the current state.
    #[must_use]
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }

    /// Returns `true` for failures of the persistence layer.
    #[must_use]
    pub fn is_storage_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::Io(_)
                | Self::WalCorruption { .. }
                | Self::SnapshotCorruption { .. }
                | Self::ChecksumMismatch { .. }
        )
    }
}

/// Runs independent cleanup steps, collecting every failure instead of
/// stopping at the first one.
#[derive(Debug)]
pub struct ErrorAggregator {
    context: String,
    errors: Vec<CoreError>,
}

impl ErrorAggregator {
    /// Creates an aggregator for the named activity.
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            errors: Vec::new(),
        }
    }

    /// Runs one step, recording its error if it fails.
    pub fn execute<F>(&mut self, step: F)
    where
        F: FnOnce() -> CoreResult<()>,
    {
        if let Err(e) = step() {
            tracing::error!(context = %self.context, error = %e, "step failed");
            self.errors.push(e);
        }
    }

    /// Records an error produced outside `execute`.
    pub fn push(&mut self, error: CoreError) {
        tracing::error!(context = %self.context, error = %error, "step failed");
        self.errors.push(error);
    }

    /// Returns `true` if nothing failed so far.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Finishes, returning `Aggregate` if any step failed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Aggregate`] holding every recorded error.
    pub fn into_result(self) -> CoreResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Aggregate {
                context: self.context,
                errors: self.errors,
            })
        }
    }
}
