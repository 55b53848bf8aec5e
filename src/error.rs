//! Crate-wide error taxonomy
//!
//! Every subsystem has its own error enum; they converge into this taxonomy
//! at component boundaries. Each variant carries a stable kind identifier
//! suitable for monitoring alerts. Messages never contain registration
//! tokens or provider credentials.

use thiserror::Error;

/// Top-level error carried across component boundaries
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure, timeout, 5xx or rate limit; retry with backoff
    #[error("transient: {0}")]
    Transient(String),

    /// Entity absent at the source of truth
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent modification or name collision
    #[error("conflict: {0}")]
    Conflict(String),

    /// State-machine violation (e.g. stop on a removed runner)
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Caller input failed validation
    #[error("invalid: {0}")]
    Invalid(String),

    /// Broken invariant or unexpected state
    #[error("internal: {0}")]
    Internal(String),

    /// Provider rejected our credentials
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl Error {
    /// Stable kind identifier for monitoring and admin surfaces
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transient(_) => "transient",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::PreconditionFailed(_) => "precondition_failed",
            Error::Invalid(_) => "invalid",
            Error::Internal(_) => "internal",
            Error::Unauthorized(_) => "unauthorized",
        }
    }

    /// Whether a caller may retry the operation with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

/// Result type used across the daemon core
pub type Result<T> = std::result::Result<T, Error>;

impl From<crate::provider::ProviderError> for Error {
    fn from(e: crate::provider::ProviderError) -> Self {
        use crate::provider::ProviderError;
        let message = e.to_string();
        match e {
            ProviderError::Unauthorized(msg) => Error::Unauthorized(msg),
            ProviderError::NotFound(msg) => Error::NotFound(msg),
            ProviderError::InvalidUrl(msg) => Error::Invalid(msg),
            ProviderError::Server { status, .. } if status < 500 => Error::Invalid(message),
            ProviderError::Parse(_) => Error::Invalid(message),
            // Timeouts, rate limits, transport failures and 5xx responses
            _ => Error::Transient(message),
        }
    }
}

impl From<crate::docker::DriverError> for Error {
    fn from(e: crate::docker::DriverError) -> Self {
        use crate::docker::DriverError;
        match e {
            DriverError::NotFound(msg) => Error::NotFound(msg),
            DriverError::Conflict(msg) => Error::Conflict(msg),
            DriverError::Timeout => Error::Transient("container runtime timed out".into()),
            DriverError::Transport(inner) => Error::Transient(inner.to_string()),
            DriverError::InvalidSpec(msg) => Error::Invalid(msg),
        }
    }
}

impl From<crate::database::DatabaseError> for Error {
    fn from(e: crate::database::DatabaseError) -> Self {
        use crate::database::DatabaseError;
        match e {
            DatabaseError::NotFound(msg) => Error::NotFound(msg),
            DatabaseError::StaleRow(msg) => Error::Conflict(msg),
            other => Error::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_identifiers_are_stable() {
        assert_eq!(Error::Transient("x".into()).kind(), "transient");
        assert_eq!(Error::NotFound("x".into()).kind(), "not_found");
        assert_eq!(Error::Conflict("x".into()).kind(), "conflict");
        assert_eq!(
            Error::PreconditionFailed("x".into()).kind(),
            "precondition_failed"
        );
        assert_eq!(Error::Invalid("x".into()).kind(), "invalid");
        assert_eq!(Error::Internal("x".into()).kind(), "internal");
        assert_eq!(Error::Unauthorized("x".into()).kind(), "unauthorized");
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(Error::Transient("x".into()).is_retryable());
        assert!(!Error::Conflict("x".into()).is_retryable());
        assert!(!Error::Unauthorized("x".into()).is_retryable());
    }
}
