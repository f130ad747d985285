use thiserror::Error;

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {id}")]
    SessionNotFound { id: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
