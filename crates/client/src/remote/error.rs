//! Delta endpoint transport errors.

use std::sync::Arc;

use stringboot_core::Error;

/// Errors from the HTTP delta source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// No API token configured.
    #[error("missing API token: STRINGBOOT_API_TOKEN not set")]
    MissingToken,

    /// Base URL could not be parsed or uses an unsupported scheme.
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),

    /// Authentication failed (invalid or revoked token).
    #[error("authentication failed: status {status}")]
    AuthError { status: u16 },

    /// Rate limited by the API.
    #[error("rate limited: too many requests")]
    RateLimited,

    /// Any other error status.
    #[error("HTTP error: {status}")]
    HttpError { status: u16 },

    /// Request timeout.
    #[error("request timeout")]
    Timeout,

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(Arc<reqwest::Error>),

    /// Response body was not a delta.
    #[error("parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() { RemoteError::Timeout } else { RemoteError::Network(Arc::new(err)) }
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::MissingToken | RemoteError::InvalidBaseUrl(_) => Error::InvalidInput(err.to_string()),
            RemoteError::Parse(msg) => Error::InvalidResponse(msg),
            other => Error::NetworkFailure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert!(RemoteError::MissingToken.to_string().contains("API token"));
        assert!(RemoteError::HttpError { status: 502 }.to_string().contains("502"));
    }

    #[test]
    fn test_conversion_to_core_error() {
        assert!(matches!(Error::from(RemoteError::Timeout), Error::NetworkFailure(_)));
        assert!(matches!(Error::from(RemoteError::RateLimited), Error::NetworkFailure(_)));
        assert!(matches!(Error::from(RemoteError::Parse("eof".into())), Error::InvalidResponse(_)));
        assert!(matches!(Error::from(RemoteError::MissingToken), Error::InvalidInput(_)));
    }
}
