//! Database error types.

use distbuild_core::ResourceId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("task {0} is already terminal")]
    AlreadyTerminal(ResourceId),

    #[error("stale completion for task {task_id}: reported epoch {reported}, current epoch {current}")]
    StaleCompletion {
        task_id: ResourceId,
        reported: i64,
        current: i64,
    },

    #[error("lease expired for task {0}")]
    LeaseExpired(ResourceId),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Decode(err.to_string())
    }
}

impl From<DbError> for distbuild_core::Error {
    fn from(err: DbError) -> Self {
        use distbuild_core::Error;
        match err {
            DbError::NotFound(msg) => Error::NotFound(msg),
            DbError::Duplicate(msg) | DbError::Conflict(msg) => Error::Conflict(msg),
            DbError::AlreadyTerminal(id) => Error::AlreadyTerminal(id),
            DbError::StaleCompletion {
                task_id,
                reported,
                current,
            } => Error::StaleCompletion {
                task_id,
                reported,
                current,
            },
            DbError::LeaseExpired(id) => Error::LeaseExpired(id),
            DbError::Unavailable(msg) => Error::Unavailable(msg),
            DbError::Database(
                e @ (sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)),
            ) => Error::Unavailable(e.to_string()),
            other => Error::Internal(other.to_string()),
        }
    }
}

/// Map a unique-constraint violation onto `Duplicate`.
pub(crate) fn map_unique(err: sqlx::Error, what: impl FnOnce() -> String) -> DbError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => DbError::Duplicate(what()),
        _ => DbError::Database(err),
    }
}
