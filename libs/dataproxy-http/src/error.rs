use std::time::Duration;
use thiserror::Error;

/// Boxed error used inside response bodies and the dial layer.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of URL validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL is missing required scheme (http/https)
    MissingScheme,
}

/// HTTP client error types
///
/// Transport-level failures are carried unchanged in [`HttpError::Transport`]
/// (the original error stays reachable through `source()`). The response size
/// limit is the only policy violation and has its own variant so callers can
/// tell it apart from I/O failures.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Request did not complete within the configured request timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport error (dial, DNS, connection reset, etc)
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),

    /// Response body exceeded the configured response limit
    #[error("response body too large, response limit is set to: {limit}")]
    ResponseLimitExceeded { limit: u64 },

    /// Request signing failed
    #[error("Request signing failed: {0}")]
    Signing(#[from] crate::middleware::SigV4Error),

    /// JSON parsing error
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Request queue is full (fail-fast)
    #[error("Service overloaded: request queue is full")]
    Overloaded,

    /// Internal service failure (buffer worker died, channel closed)
    #[error("Service unavailable: internal failure")]
    ServiceClosed,

    /// Invalid URL (failed to parse)
    ///
    /// Match on `kind`; `reason` is a diagnostic message for logging only.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        /// The URL that failed to parse
        url: String,
        /// Structured failure classification for programmatic matching
        kind: InvalidUriKind,
        /// Diagnostic message (unstable format, for logging only)
        reason: String,
    },

    /// Invalid URL scheme for transport security configuration
    #[error("URL scheme '{scheme}' not allowed: {reason}")]
    InvalidScheme {
        /// The URL scheme that was rejected
        scheme: String,
        /// Reason the scheme was rejected
        reason: String,
    },
}

impl HttpError {
    /// Returns `true` when the response exceeded the configured size limit.
    ///
    /// Such failures are deterministic for a given upstream response and
    /// should not be retried.
    #[must_use]
    pub fn is_response_limit_exceeded(&self) -> bool {
        matches!(self, HttpError::ResponseLimitExceeded { .. })
    }

    /// Recover an `HttpError` from a boxed error produced by a body or a
    /// tower layer, wrapping anything else as [`HttpError::Transport`].
    #[must_use]
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<HttpError>() {
            Ok(http_err) => *http_err,
            Err(other) => HttpError::Transport(other),
        }
    }
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fmt;

    #[derive(Debug)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Error for TestError {}

    #[test]
    fn test_transport_error_preserves_source() {
        let err = HttpError::Transport(Box::new(TestError("connection refused")));

        let source = err.source().expect("Transport error should have a source");
        let downcast = source.downcast_ref::<TestError>();
        assert!(downcast.is_some(), "Should be able to downcast to TestError");
        assert_eq!(downcast.unwrap().0, "connection refused");
    }

    #[test]
    fn test_from_boxed_recovers_limit_error() {
        let boxed: BoxError = Box::new(HttpError::ResponseLimitExceeded { limit: 10 });
        let err = HttpError::from_boxed(boxed);
        assert!(err.is_response_limit_exceeded());
    }

    #[test]
    fn test_from_boxed_wraps_foreign_error() {
        let boxed: BoxError = Box::new(TestError("reset by peer"));
        let err = HttpError::from_boxed(boxed);
        assert!(matches!(err, HttpError::Transport(_)));
        assert!(!err.is_response_limit_exceeded());
        assert_eq!(err.source().unwrap().to_string(), "reset by peer");
    }

    #[test]
    fn test_limit_error_message() {
        let err = HttpError::ResponseLimitExceeded { limit: 1024 };
        assert_eq!(
            err.to_string(),
            "response body too large, response limit is set to: 1024"
        );
    }
}
