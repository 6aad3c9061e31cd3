//! Error types for the vaultsync engine
//!
//! All errors use thiserror for structured error handling.
//! These errors can be serialized to the transport layer.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Ownership mismatch: {0}")]
    OwnershipMismatch(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Write queue full for user {uid}")]
    QueueFull { uid: i64 },

    #[error("Write timed out for user {uid}")]
    WriteTimeout { uid: i64 },

    #[error("Write serializer is shutting down")]
    ShuttingDown,

    #[error("Shutdown deadline exceeded, {abandoned} queued writes abandoned")]
    ShutdownIncomplete { abandoned: usize },

    #[error("Write aborted: {0}")]
    WriteAborted(String),

    #[error("Search unavailable: {0}")]
    SearchUnavailable(String),

    #[error("Patch error: {0}")]
    Patch(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("{0}")]
    Generic(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Transient serializer failures; the caller should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::QueueFull { .. } | EngineError::WriteTimeout { .. }
        )
    }

    /// Errors caused by the request rather than the engine (4xx class).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound { .. }
                | EngineError::OwnershipMismatch(_)
                | EngineError::InvalidInput(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}

impl serde::Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::QueueFull { uid: 1 }.is_retryable());
        assert!(EngineError::WriteTimeout { uid: 1 }.is_retryable());
        assert!(!EngineError::ShuttingDown.is_retryable());
        assert!(!EngineError::not_found("note", 3).is_retryable());
    }

    #[test]
    fn test_client_error_classification() {
        assert!(EngineError::not_found("note", 3).is_client_error());
        assert!(EngineError::OwnershipMismatch("x".into()).is_client_error());
        assert!(EngineError::InvalidInput("uid".into()).is_client_error());
        assert!(!EngineError::SearchUnavailable("x".into()).is_client_error());
        assert!(!EngineError::WriteTimeout { uid: 1 }.is_client_error());
    }

    #[test]
    fn test_display_and_serialize() {
        let err = EngineError::not_found("note", 42);
        assert_eq!(err.to_string(), "note not found: 42");

        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"note not found: 42\"");
    }
}
