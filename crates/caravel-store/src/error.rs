//! Error types for the bundle store

use caravel_bundle::BundleId;
use thiserror::Error;

/// Errors surfaced by storage operations
///
/// Transient persistence failures are not represented here: durable writes
/// are asynchronous and retried by the pipeline, so the original caller never
/// sees them. A record that turns out to be unrecoverable surfaces as
/// `LoadFailed` once and is purged.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No bundle matches the requested identity, destination or filter
    #[error("No bundle found")]
    NotFound,

    /// Admitting the bundle would exceed the configured byte quota
    #[error("Storage quota exceeded (requested {requested} bytes, {available} available)")]
    SizeExceeded { requested: u64, available: u64 },

    /// The durable artifact for a bundle is missing or corrupt
    #[error("Failed to load bundle {id}: {reason}")]
    LoadFailed { id: BundleId, reason: String },

    /// A fragment's offset or length is inconsistent with its group
    #[error("Invalid fragment: {0}")]
    InvalidFragment(String),

    /// I/O error during a storage operation
    #[error("I/O error: {0}")]
    Io(String),

    /// Wire encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The store has been shut down and accepts no further work
    #[error("Store is shut down")]
    ShutDown,
}

impl StoreError {
    /// Create a new I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    /// Create a new serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new load-failure error
    pub fn load_failed(id: BundleId, reason: impl Into<String>) -> Self {
        Self::LoadFailed {
            id,
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<postcard::Error> for StoreError {
    fn from(err: postcard::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<caravel_bundle::BundleError> for StoreError {
    fn from(err: caravel_bundle::BundleError) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;
