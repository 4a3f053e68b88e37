//! CLI error type.

use std::path::PathBuf;
use tessera_core::CoreError;
use thiserror::Error;

/// Errors reported by the commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// A command that needs `--path` ran without it.
    #[error("database path required for {0}")]
    MissingPath(&'static str),

    /// The path holds no database files.
    #[error("no database found at {}", .0.display())]
    NotADatabase(PathBuf),

    /// A check found damage.
    #[error("verification failed: {0}")]
    Verification(String),

    /// The command cannot run as asked.
    #[error("{0}")]
    Refused(String),

    /// Engine error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Storage backend error.
    #[error(transparent)]
    Storage(#[from] tessera_storage::StorageError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON output error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result alias of the commands.
pub type CliResult<T> = Result<T, CliError>;
