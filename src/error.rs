//! Error types for taskmesh.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidState { from: String, to: String },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Optimistic version check failed; the record changed underneath us.
    #[error("version conflict: {0}")]
    Conflict(String),

    #[error("no eligible worker")]
    NoEligibleWorker,

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors a periodic loop recovers from by retrying on its next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Conflict(_) | Error::NoEligibleWorker | Error::Persistence(_)
        )
    }

    pub(crate) fn invalid_state(from: impl ToString, to: impl ToString) -> Self {
        Error::InvalidState {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
