//! Error types for distbuild.

use thiserror::Error;

use crate::ResourceId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

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

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// A lost completion race. Callers treat these as a successful no-op.
    pub fn is_race(&self) -> bool {
        matches!(
            self,
            Error::AlreadyTerminal(_) | Error::StaleCompletion { .. }
        )
    }

    /// Errors the caller may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_race_classification() {
        let id = ResourceId::new();
        assert!(Error::AlreadyTerminal(id).is_race());
        assert!(
            Error::StaleCompletion {
                task_id: id,
                reported: 1,
                current: 2
            }
            .is_race()
        );
        assert!(!Error::NotFound("task".to_string()).is_race());
        assert!(!Error::Validation("bad".to_string()).is_race());
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout("sign".to_string()).is_transient());
        assert!(Error::Unavailable("pool".to_string()).is_transient());
        assert!(!Error::LeaseExpired(ResourceId::new()).is_transient());
    }
}
