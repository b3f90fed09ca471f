// Storage error taxonomy
use thiserror::Error;

/// Result alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by every [`Storage`](super::Storage) backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No blob is stored at the key
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// The key has no children. Listing an absent key and listing an emptied
    /// one are deliberately the same error.
    #[error("Directory is empty or does not exist: {0}")]
    Empty(String),

    /// The write would make a key both a blob and a directory
    #[error("Key conflict at {key}: {reason}")]
    Conflict { key: String, reason: &'static str },

    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// Failure of the backing medium
    #[error("{context}")]
    Medium {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The caller's after-write hook rejected the stored blob
    #[error("After-write hook failed for {key}")]
    AfterWrite {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl StorageError {
    pub(crate) fn medium(context: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Medium {
            context: context.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, StorageError::Empty(_))
    }
}
