use thiserror::Error;

/// Failures raised by a persistent-tier backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage quota exceeded: need {needed} bytes, capacity is {capacity} bytes")]
    QuotaExceeded { needed: u64, capacity: u64 },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

/// Internal cache failures. These never escape the public cache API, which
/// degrades to a miss or to memory-only storage instead.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Persistent tier error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid key pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Failures turning a textual event name into a `DomainEvent`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Unknown event: {0}")]
    Unknown(String),

    #[error("Event '{0}' requires a subject id")]
    MissingSubject(&'static str),
}
