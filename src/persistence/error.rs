//! Error types for the persistence layer.

use thiserror::Error;

/// Errors that can occur in the persistence layer.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// A general error occurred during a data store operation.
    #[error("a data store operation failed: {0}")]
    OperationFailed(String),

    /// A stored value could not be interpreted.
    #[error("failed to decode stored data: {0}")]
    Corrupt(String),

    /// An error occurred during a database migration.
    #[error("a data migration failed: {0}")]
    Migration(String),

    /// An invalid configuration or input was provided.
    #[error("invalid persistence input: {0}")]
    InvalidInput(String),
}
