//! Engine error types

use thiserror::Error;

/// Errors raised by the reconciliation engine
#[derive(Error, Debug)]
pub enum StatecraftError {
    #[error("No active scope: call this inside Scope::run or Scope::enter_root")]
    NoActiveScope,

    #[error("Cannot {action} a secret: no password configured for scope '{scope}'")]
    MissingPassword { scope: String, action: &'static str },

    #[error("Symbol '{0}' is not registered and cannot be restored after a restart")]
    UniqueSymbol(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Malformed '{tag}' value: {message}")]
    InvalidTag { tag: &'static str, message: String },

    #[error("Invalid resource id '{id}': {reason}")]
    InvalidResourceId { id: String, reason: &'static str },

    #[error("Invalid scope name: {0}")]
    InvalidScopeName(String),

    #[error("Resource already declared in this scope: {0}")]
    DuplicateResource(String),

    #[error("No handler registered for resource kind: {0}")]
    UnknownResourceKind(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Handler for {0} returned Deleted outside of a delete event")]
    UnexpectedDestroy(String),

    #[error("Value is not a resource output: {0}")]
    NotAResource(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error(transparent)]
    Handler(#[from] anyhow::Error),

    #[error("{failed} of {total} operations failed; first error: {first}")]
    Aggregate {
        failed: usize,
        total: usize,
        first: Box<StatecraftError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StatecraftError {
    /// Wraps a backend-specific failure
    pub fn store(err: impl std::fmt::Display) -> Self {
        StatecraftError::Store(err.to_string())
    }

    /// Collapses per-item failures into a single error, or `Ok` when none failed
    pub fn aggregate(mut errors: Vec<StatecraftError>, total: usize) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let failed = errors.len();
        let first = errors.swap_remove(0);
        Err(StatecraftError::Aggregate {
            failed,
            total,
            first: Box::new(first),
        })
    }
}

pub type Result<T> = std::result::Result<T, StatecraftError>;
