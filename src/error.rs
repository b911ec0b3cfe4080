//! Unified error types.
//!
//! Application-level outcomes (404, redirects, 500s) are expressed through
//! [`Outcome`](crate::Outcome), not through these types. `Error` surfaces
//! infrastructure failures: loading configuration, binding a port, accepting
//! a connection. `ParseError` is what the request layer reports when a
//! request head cannot be turned into a [`Request`](crate::Request).

use std::fmt;

use http::StatusCode;

use crate::config::ConfigError;

/// The error type returned by wicket's fallible server operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

/// Why a request head could not be read off the wire.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request header block exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },

    #[error("request body of {length} bytes exceeds {limit} bytes")]
    BodyTooLarge { length: u64, limit: usize },

    #[error("unsupported transfer-encoding `{0}`")]
    UnsupportedTransferEncoding(String),

    #[error("connection closed before the request was complete")]
    UnexpectedEof,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// The status a synthesized error response carries for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Malformed(_) | Self::UnexpectedEof | Self::Io(_) => StatusCode::BAD_REQUEST,
            Self::HeadersTooLarge { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedTransferEncoding(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }
}

/// An unexpected failure inside a handler.
///
/// The message and source are logged server-side in full; the client only
/// sees a generic 500 unless `expose_error_detail` is enabled.
#[derive(Debug)]
pub struct Fault {
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), source: None }
    }

    /// Wraps an underlying error with a short description of what failed.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self { message: message.into(), source: Some(Box::new(source)) }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {source}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Fault {
    fn from(e: std::io::Error) -> Self {
        Self::with_source("i/o failure", e)
    }
}
