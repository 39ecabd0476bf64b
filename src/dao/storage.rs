use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by storage backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or failed.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// What the store was doing.
        message: String,
        /// Backend failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// Optimistic version check failed: someone else committed first.
    #[error("{entity} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        /// Entity whose version was checked.
        entity: String,
        /// Version the writer read.
        expected: u64,
        /// Version found in the store.
        actual: u64,
    },
    /// Entity that should exist is absent.
    #[error("{0} not found")]
    Missing(String),
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }
}
