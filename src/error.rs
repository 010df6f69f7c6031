//! Error taxonomy for task commands and queries.
//!
//! Business-rule violations (`InvalidTransition`, `AlreadyCompleted`, the
//! not-found variants) are deterministic and returned to the caller as-is.
//! `StorageConflict` means the transaction was aborted by a concurrent
//! writer; retrying the whole command is safe. Publish failures never appear
//! here — they are contained inside the relay (see `broker::PublishError`).

use crate::types::TaskStatus;
use thiserror::Error;

/// Result type for task operations.
pub type TaskResult<T> = std::result::Result<T, TaskError>;

#[derive(Debug, Error)]
pub enum TaskError {
    /// The command is not valid from the task's current state.
    #[error("cannot {action} task in state '{state}'", state = .status.as_str())]
    InvalidTransition {
        action: &'static str,
        status: TaskStatus,
    },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(i64),

    /// Checkpoint completion is one-shot; a second attempt is rejected.
    #[error("checkpoint {0} is already completed")]
    AlreadyCompleted(i64),

    /// Transaction aborted by a concurrent conflicting write. Safe to retry.
    #[error("storage conflict, retry the command")]
    StorageConflict,

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("migration error: {0}")]
    Migration(#[from] refinery::Error),
}

impl From<rusqlite::Error> for TaskError {
    fn from(err: rusqlite::Error) -> Self {
        // SQLITE_BUSY / SQLITE_LOCKED abort the transaction without applying
        // anything, so they map to the retryable conflict variant.
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return TaskError::StorageConflict;
            }
        }
        TaskError::Database(err)
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Database(rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
    }
}
