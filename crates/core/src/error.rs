//! Unified error types for the Stringboot client engine.
//!
//! Absence of a key is never an error: every read path returns `Ok(None)` so
//! callers can apply their own fallback.

use std::sync::Arc;

use tokio_rusqlite::rusqlite;

use crate::config::ConfigError;

/// Unified error type shared by the store, sync engine and client facade.
///
/// `Clone` so that a single in-flight sync can hand the same failure to every
/// caller that joined it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// An operation was attempted before the client finished initializing.
    #[error("NOT_INITIALIZED: {0}")]
    NotInitialized(String),

    /// Remote delta endpoint unreachable, timed out, or answered with an error status.
    #[error("NETWORK_FAILURE: {0}")]
    NetworkFailure(String),

    /// Remote answered, but the payload could not be used.
    #[error("INVALID_RESPONSE: {0}")]
    InvalidResponse(String),

    /// A multi-statement write was rolled back; nothing from it was persisted.
    #[error("TRANSACTION_FAILURE: {0}")]
    TransactionFailure(String),

    /// Single-statement store operation failed.
    #[error("STORE_ERROR: {0}")]
    Database(Arc<tokio_rusqlite::Error>),

    /// Store connection failed in a way without a more specific variant.
    #[error("STORE_ERROR: {0}")]
    Storage(String),

    /// Migration failed to apply.
    #[error("STORE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// Caller supplied an argument the engine cannot accept.
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded or failed validation.
    #[error("CONFIG_ERROR: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Whether the caller may reasonably retry the operation as-is.
    ///
    /// Network and transaction failures leave committed state untouched, so a
    /// retry starts from the same cursor.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NetworkFailure(_) | Error::InvalidResponse(_) | Error::TransactionFailure(_))
    }

    pub(crate) fn transaction(err: impl std::fmt::Display) -> Self {
        Error::TransactionFailure(err.to_string())
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(Arc::new(tokio_rusqlite::Error::ConnectionClosed)),
            tokio_rusqlite::Error::Close(c) => Error::Database(Arc::new(tokio_rusqlite::Error::Close(c))),
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(Arc::new(err))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(Arc::new(tokio_rusqlite::Error::Error(err)))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidResponse(err.to_string())
    }
}
