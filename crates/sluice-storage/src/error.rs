//! Storage error types.

use thiserror::Error;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Error from the MySQL driver or pool.
    #[error("MySQL error: {0}")]
    MySql(#[from] sqlx::Error),

    /// Error from the embedded SQLite database.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (e.g., creating directories).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored value could not be interpreted.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// The store has been shut down.
    #[error("Store is closed")]
    Closed,

    /// A blocking database task panicked or was cancelled.
    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
