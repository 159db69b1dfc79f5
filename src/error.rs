//! Error types for the Freight operator

use thiserror::Error;

/// Main error type for Freight operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Bundle content could not be fetched or unpacked
    #[error("content error: {0}")]
    Content(String),

    /// Signature verification failure
    #[error("signature error: {0}")]
    Signature(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Raw manifest could not be applied
    #[error("manifest apply error: {0}")]
    ManifestApply(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a content error with the given message
    pub fn content(msg: impl Into<String>) -> Self {
        Self::Content(msg.into())
    }

    /// Create a signature error with the given message
    pub fn signature(msg: impl Into<String>) -> Self {
        Self::Signature(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a manifest apply error with the given message
    pub fn manifest_apply(msg: impl Into<String>) -> Self {
        Self::ManifestApply(msg.into())
    }
}
