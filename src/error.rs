//! Error types for the cloud controller manager

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid cloud configuration, fatal at startup
    #[error("config error: {0}")]
    Config(String),

    /// The machine API could not be reached within the retry budget
    #[error("platform API unavailable: {0}")]
    PlatformUnavailable(String),

    /// Validation error for selectors, transformation rules or CIDRs
    #[error("validation error: {0}")]
    Validation(String),

    /// No free subnet left in any matching cluster CIDR
    #[error("CIDR allocation failed; there are no remaining CIDRs left to allocate in the accepted range")]
    CidrExhausted,

    /// A CIDR operation conflicts with the allocator state
    #[error("CIDR conflict: {0}")]
    CidrConflict(String),

    /// The referenced object no longer exists
    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a platform-unavailable error with the given message
    pub fn platform_unavailable(msg: impl Into<String>) -> Self {
        Self::PlatformUnavailable(msg.into())
    }

    /// Create a CIDR conflict error with the given message
    pub fn cidr_conflict(msg: impl Into<String>) -> Self {
        Self::CidrConflict(msg.into())
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}
