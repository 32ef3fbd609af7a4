//! Migration safety-layer error types

use std::time::Duration;
use thiserror::Error;

/// Errors raised inside the safety layer.
///
/// These never cross the [`MigrationManager`](super::MigrationManager) boundary: every public
/// operation converts them into a failed outcome carrying the rendered message.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The underlying migration runner reported an error
    #[error("Migration runner error during {operation}: {message}")]
    Runner {
        operation: &'static str,
        message: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid migration version '{0}'")]
    InvalidVersion(String),

    /// The runner's history violates an ordering invariant
    #[error("Invalid schema history: {0}")]
    InvalidHistory(String),

    #[error("Migration script not found for version {version} ({description})")]
    ScriptNotFound {
        version: String,
        description: String,
    },

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{0} was cancelled")]
    Cancelled(&'static str),

    /// Another mutating operation holds the campaign lock
    #[error("Another migration operation is in progress: {0}")]
    LockTimeout(String),

    #[error("Backup error: {0}")]
    Backup(String),
}

impl GuardError {
    pub fn runner(operation: &'static str, message: impl Into<String>) -> Self {
        GuardError::Runner {
            operation,
            message: message.into(),
        }
    }

    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        GuardError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(error: serde_json::Error) -> Self {
        GuardError::Backup(format!("invalid backup manifest: {error}"))
    }
}
