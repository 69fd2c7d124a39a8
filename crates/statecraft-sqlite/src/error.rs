//! SQLite state store error types

use statecraft_core::StatecraftError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SqliteStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database is locked by {holder} since {since}")]
    Locked { holder: String, since: String },

    #[error("Migration {version} failed: {message}")]
    Migration { version: u32, message: String },

    #[error("Database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("Blocking task failed: {0}")]
    Task(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<SqliteStoreError> for StatecraftError {
    fn from(err: SqliteStoreError) -> Self {
        StatecraftError::store(err)
    }
}

pub type Result<T> = std::result::Result<T, SqliteStoreError>;
