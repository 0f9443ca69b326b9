//! Error types for checkpoint operations

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors surfaced by the checkpoint store
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// No such thread, namespace or checkpoint
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// A record already exists under the key with different content
    #[error("Checkpoint already exists with different content: {0}")]
    AlreadyExists(String),

    /// A record references a blob that is absent or corrupt
    #[error("Blob missing for {location}: {reason}")]
    BlobMissing { location: String, reason: String },

    /// A stored format tag is not understood by this codec
    #[error("Unsupported format tag: {0}")]
    UnsupportedFormat(String),

    /// Transient backend failures outlasted the retry budget
    #[error("Backend unavailable after {attempts} attempts during {operation}: {last_error}")]
    Unavailable {
        operation: String,
        attempts: usize,
        last_error: String,
    },

    /// Non-retryable backend failure
    #[error("Backend error: {0}")]
    Backend(BackendError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),

    /// Invalid caller input
    #[error("Invalid checkpoint: {0}")]
    Invalid(String),

    /// Configuration could not be loaded or validated
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    /// True for [`CheckpointError::NotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, CheckpointError::NotFound(_))
    }
}

impl From<toml::de::Error> for CheckpointError {
    fn from(err: toml::de::Error) -> Self {
        CheckpointError::Config(err.to_string())
    }
}

/// Errors reported by the key-value and object store capabilities
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The write condition did not hold (key already present)
    #[error("Condition failed for key {0}")]
    ConditionFailed(String),

    /// Throttling, connection reset and similar; safe to retry
    #[error("Transient backend failure: {0}")]
    Transient(String),

    /// The attempt did not complete within its deadline
    #[error("Backend call timed out after {0}ms")]
    Timeout(u64),

    /// The item exceeds the store's per-item limit
    #[error("Item of {size} bytes exceeds limit of {limit} bytes")]
    ItemTooLarge { size: usize, limit: usize },

    /// Any other failure
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Whether the failure may succeed when retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_) | BackendError::Timeout(_))
    }
}

/// Result type for backend capability calls
pub type BackendResult<T> = std::result::Result<T, BackendError>;
