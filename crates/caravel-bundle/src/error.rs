//! Bundle-related error types

use thiserror::Error;

/// Errors that can occur while building or decoding bundles
#[derive(Debug, Error)]
pub enum BundleError {
    /// An endpoint URI could not be parsed
    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// The bundle carries no payload block
    #[error("Bundle has no payload block")]
    MissingPayload,

    /// Fragment fields are inconsistent with the payload
    #[error("Invalid fragment: {0}")]
    InvalidFragment(String),

    /// Wire encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<postcard::Error> for BundleError {
    fn from(err: postcard::Error) -> Self {
        BundleError::Codec(err.to_string())
    }
}

/// Result type for bundle operations
pub type BundleResult<T> = Result<T, BundleError>;
