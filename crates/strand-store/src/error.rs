use thiserror::Error;

/// Errors produced by the SQLite-backed stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A lookup by key matched no row.
    #[error("Record not found")]
    NotFound,

    #[error("Migration v{version:03} failed: {reason}")]
    Migration { version: u32, reason: String },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors produced by a [`crate::ContentStore`].
#[derive(Error, Debug)]
pub enum ContentError {
    #[error("Content not found: {0}")]
    NotFound(String),

    #[error("Empty content")]
    Empty,

    #[error("Invalid content id: {0}")]
    InvalidId(String),

    #[error("No name record published for {0}")]
    NotPublished(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
