//! Error types used across the instance database.

use thiserror::Error;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Recoverable errors surfaced by the database and its data viewer.
///
/// Unrecoverable conditions (deadlock detected by the reentrancy guard,
/// out-of-order listener pops, sigmask syscall failures) panic instead;
/// they indicate programmer errors, not runtime state the caller could
/// react to.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous result: {0}")]
    Ambiguous(String),
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Parse(err.to_string())
    }
}
