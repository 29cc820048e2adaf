use caseflow_model::{ItemId, ModelError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntakeError {
    /// The file lacks a stable identity or is not parseable. Terminal for
    /// that file until an operator replaces it.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The content store root could not be written. Retryable.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Item already cataloged: {0}")]
    DuplicateItem(ItemId),

    #[error("No queued work items")]
    QueueEmpty,

    /// Unknown work item, or one not owned by the caller. The two are
    /// deliberately indistinguishable.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unrenderable file: {0}")]
    UnrenderableFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntakeError {
    /// Transient failures leave the file observed and are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IntakeError::StorageUnavailable(_)
                | IntakeError::Io(_)
                | IntakeError::Database(_)
        )
    }
}

impl From<ModelError> for IntakeError {
    fn from(err: ModelError) -> Self {
        IntakeError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IntakeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(IntakeError::StorageUnavailable("ro".into()).is_retryable());
        assert!(IntakeError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!IntakeError::MalformedInput("x".into()).is_retryable());
        assert!(!IntakeError::QueueEmpty.is_retryable());
        assert!(!IntakeError::NotFound("w".into()).is_retryable());
    }
}
