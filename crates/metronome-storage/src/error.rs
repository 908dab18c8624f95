use thiserror::Error;

/// Errors surfaced by a storage adapter.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying SQLite / rusqlite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A persisted record no longer deserializes.
    #[error("corrupt record {entry:?}: {reason}")]
    Corrupt { entry: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;
