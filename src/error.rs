//! Error types for the sync core.

use thiserror::Error;

/// Main error type for store, service and client operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record is missing the issue number")]
    MissingIdentity,

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Issue number already exists: {0}")]
    AlreadyExists(String),

    #[error("Backing store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid client id: {0}")]
    InvalidClientId(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid table: {0}")]
    InvalidTable(String),

    #[error("Invalid search filter: {0}")]
    InvalidFilter(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(u64),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the failure came from the store or the transport rather than
    /// from the request itself.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            SyncError::Io(_) | SyncError::StoreUnavailable(_) | SyncError::Network(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(e: toml::de::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Network(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
