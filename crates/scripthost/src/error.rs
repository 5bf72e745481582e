//! Error types for workspace and supervisor operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the workspace manager and the process supervisor.
///
/// Every variant is recovered at the command adapter and rendered as a
/// user-visible failure message.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Extension is neither a runnable script nor an archive.
    #[error("unsupported file type: {file_name}")]
    UnsupportedType { file_name: String },

    /// Name contains separators, `..`, or is otherwise not a plain file name.
    #[error("invalid file name: {file_name:?}")]
    InvalidFileName { file_name: String },

    #[error("script not found: {file_name}")]
    ScriptNotFound { file_name: String },

    /// Archive could not be opened or read.
    #[error("corrupt archive {path}: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    /// I/O error on the upload or log directories.
    #[error("I/O error at {path}: {source}")]
    StorageFault {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Interpreter could not be launched.
    #[error("failed to start {file_name}: {source}")]
    SpawnFault {
        file_name: String,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    pub fn unsupported_type(file_name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            file_name: file_name.into(),
        }
    }

    pub fn invalid_file_name(file_name: impl Into<String>) -> Self {
        Self::InvalidFileName {
            file_name: file_name.into(),
        }
    }

    pub fn script_not_found(file_name: impl Into<String>) -> Self {
        Self::ScriptNotFound {
            file_name: file_name.into(),
        }
    }

    pub fn corrupt_archive(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CorruptArchive {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a storage fault with path context.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StorageFault {
            path: path.into(),
            source,
        }
    }

    pub fn spawn(file_name: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFault {
            file_name: file_name.into(),
            source,
        }
    }
}

/// Convenience type alias for supervisor results.
pub type SupervisorResult<T> = Result<T, SupervisorError>;
