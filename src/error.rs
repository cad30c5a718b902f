//! Error taxonomy shared by every stage of the indexing pipeline.

use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

pub type Result<T, E = IndexError> = std::result::Result<T, E>;

/// Fieldless discriminant of [`IndexError`], convenient for matching on
/// retry/propagation policy without destructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    ToolUnavailable,
    ExtractionFailed,
    StoreBusy,
    StoreFatal,
    Store,
    StateDrifted,
    Timeout,
    Io,
    Serialization,
    Task,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("metadata tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("metadata extraction failed for {}: {reason}", path.display())]
    ExtractionFailed { path: PathBuf, reason: String },

    /// Lock contention on the catalog store. Retried by the caller.
    #[error("catalog store is busy: {0}")]
    StoreBusy(#[source] rusqlite::Error),

    /// Corruption or an unusable database file. Never swallowed.
    #[error("catalog store is unusable: {0}")]
    StoreFatal(#[source] rusqlite::Error),

    /// Any other store failure (constraint violation, bad SQL).
    #[error("catalog store error: {0}")]
    Store(#[source] rusqlite::Error),

    #[error("file changed while it was being indexed: {}", .0.display())]
    StateDrifted(PathBuf),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

impl IndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IndexError::InvalidInput(_) => ErrorKind::InvalidInput,
            IndexError::NotFound(_) => ErrorKind::NotFound,
            IndexError::ToolUnavailable(_) => ErrorKind::ToolUnavailable,
            IndexError::ExtractionFailed { .. } => ErrorKind::ExtractionFailed,
            IndexError::StoreBusy(_) => ErrorKind::StoreBusy,
            IndexError::StoreFatal(_) => ErrorKind::StoreFatal,
            IndexError::Store(_) => ErrorKind::Store,
            IndexError::StateDrifted(_) => ErrorKind::StateDrifted,
            IndexError::Timeout(_) => ErrorKind::Timeout,
            IndexError::Io(_) => ErrorKind::Io,
            IndexError::Json(_) => ErrorKind::Serialization,
            IndexError::Task(_) => ErrorKind::Task,
        }
    }

    /// Errors worth retrying after a short wait.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::StoreBusy | ErrorKind::Timeout)
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::StoreFatal
    }
}

impl From<rusqlite::Error> for IndexError {
    fn from(err: rusqlite::Error) -> Self {
        let code = match &err {
            rusqlite::Error::SqliteFailure(inner, _) => Some(inner.code),
            _ => None,
        };
        match code {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                IndexError::StoreBusy(err)
            }
            Some(ErrorCode::DatabaseCorrupt)
            | Some(ErrorCode::NotADatabase)
            | Some(ErrorCode::CannotOpen)
            | Some(ErrorCode::DiskFull)
            | Some(ErrorCode::SystemIoFailure) => IndexError::StoreFatal(err),
            _ => IndexError::Store(err),
        }
    }
}

impl From<tokio::task::JoinError> for IndexError {
    fn from(err: tokio::task::JoinError) -> Self {
        IndexError::Task(err.to_string())
    }
}
