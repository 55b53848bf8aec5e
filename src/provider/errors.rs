//! Provider API error types

use thiserror::Error;

/// Errors that can occur when talking to the provider
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Failed to parse a response body
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// Provider returned an error response
    #[error("provider error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Credentials were rejected
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Resource absent at the provider
    #[error("not found: {0}")]
    NotFound(String),

    /// Rate limited, locally or by the provider
    #[error("rate limited, retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Request timed out
    #[error("request timed out")]
    Timeout,

    /// All retry attempts exhausted
    #[error("all retry attempts exhausted: {0}")]
    RetryExhausted(String),

    /// Invalid base URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl ProviderError {
    /// Whether this error is retryable with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Request(e) => e.is_connect() || e.is_timeout(),
            ProviderError::Server { status, .. } => *status >= 500,
            ProviderError::RateLimited { .. } => true,
            ProviderError::Timeout => true,
            _ => false,
        }
    }
}

/// Result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::Server {
            status: 503,
            message: "down".into()
        }
        .is_retryable());

        assert!(!ProviderError::Server {
            status: 422,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!ProviderError::Unauthorized("nope".into()).is_retryable());
        assert!(!ProviderError::NotFound("gone".into()).is_retryable());
    }
}
