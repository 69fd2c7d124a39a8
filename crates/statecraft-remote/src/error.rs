//! Remote state store error types

use statecraft_core::StatecraftError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteStoreError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid state service URL: {0}")]
    InvalidUrl(String),

    #[error("State service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("State service error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl From<RemoteStoreError> for StatecraftError {
    fn from(err: RemoteStoreError) -> Self {
        StatecraftError::store(err)
    }
}

pub type Result<T> = std::result::Result<T, RemoteStoreError>;
