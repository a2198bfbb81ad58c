//! Error types for tierq.

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("command '{command}' failed: {reason}")]
    Command { command: String, reason: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Storage contention that is safe to retry from scratch.
    ///
    /// SQLite reports lock conflicts between connections as `SQLITE_BUSY`
    /// and shared-cache table conflicts as `SQLITE_LOCKED`.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Storage(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> Error {
        Error::Storage(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            None,
        ))
    }

    #[test]
    fn busy_and_locked_are_transient() {
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_BUSY).is_transient());
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_LOCKED).is_transient());
    }

    #[test]
    fn other_errors_are_not_transient() {
        assert!(!sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT).is_transient());
        assert!(!Error::Other("boom".into()).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
    }
}
