//! Transport-level error shared across crates.

use std::error::Error as StdError;

/// Failures that happen below HTTP semantics: the request never produced a
/// response the caller could classify.
///
/// These are never retried by the session core; retry policy belongs to
/// the caller.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum TransportError {
    /// Failed to establish connection to server
    #[error("connection error: {0}")]
    #[diagnostic(
        code(bramble::transport::connect),
        help("check network connectivity and DNS")
    )]
    Connect(String),

    /// Request timed out
    #[error("request timeout")]
    #[diagnostic(code(bramble::transport::timeout))]
    Timeout,

    /// Request construction failed (malformed URI, headers, etc.)
    #[error("invalid request: {0}")]
    #[diagnostic(code(bramble::transport::invalid_request))]
    InvalidRequest(String),

    /// Other transport error
    #[error("transport error: {0}")]
    #[diagnostic(code(bramble::transport::other))]
    Other(Box<dyn StdError + Send + Sync>),
}

impl TransportError {
    /// Wrap an [`HttpClient`](crate::HttpClient) error, classifying it when
    /// the client is reqwest.
    pub fn other(source: impl StdError + Send + Sync + 'static) -> Self {
        let boxed: Box<dyn StdError + Send + Sync> = Box::new(source);
        #[cfg(feature = "reqwest-client")]
        let boxed = match boxed.downcast::<reqwest::Error>() {
            Ok(e) => return Self::from(*e),
            Err(boxed) => boxed,
        };
        Self::Other(boxed)
    }
}

#[cfg(feature = "reqwest-client")]
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_builder() || e.is_request() {
            Self::InvalidRequest(e.to_string())
        } else {
            Self::Other(Box::new(e))
        }
    }
}

impl From<http::Error> for TransportError {
    fn from(e: http::Error) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}
