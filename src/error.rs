//! Error types for lms-dl
//!
//! This module provides the error taxonomy shared by the virtual
//! filesystem, the data source, and the download orchestrator:
//! - Namespace errors (`NotFound`, `AlreadyExists`, `CycleDetected`)
//! - Remote errors (`ServerError`, `MalformedResponse`, `Network`)
//! - State-machine misuse (`InvalidOperation`) — always fatal, never retried
//! - I/O and serialization failures from the underlying layers

use thiserror::Error;

/// Result type alias for lms-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for lms-dl
///
/// This is the primary error type used throughout the library. Each variant
/// includes contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// A path component did not resolve to a child of its directory
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// A child with the same sanitized name already exists in the directory,
    /// or a disk destination collided during materialization
    #[error("file already exists: {0}")]
    AlreadyExists(String),

    /// The remote server answered with a non-success HTTP status
    #[error("server returned HTTP status {status}")]
    ServerError {
        /// The HTTP status code the server answered with
        status: u16,
    },

    /// The remote server claimed JSON but the body did not parse as JSON,
    /// or a response was missing a field the platform always provides
    #[error("server returned malformed data: {body}")]
    MalformedResponse {
        /// The offending response body, flattened to a single line
        body: String,
    },

    /// Misuse of the readiness state machine or of the tree API.
    /// This indicates a core invariant violation, not a transient fault.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// An internal-link chain re-entered itself during resolution
    #[error("link cycle detected while resolving {path}")]
    CycleDetected {
        /// The target path whose resolution exceeded the depth guard
        path: String,
    },

    /// I/O error from the disk layer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error from the HTTP session
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Delimited-table serialization error
    #[error("table serialization error: {0}")]
    Table(#[from] csv::Error),

    /// A configured or computed URL failed to parse
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "endpoints.api_url")
        key: Option<String>,
    },

    /// A credential helper failed its handshake or exited unsuccessfully
    #[error("credential helper error: {0}")]
    Helper(String),
}

impl Error {
    /// Construct a `NotFound` error for a path or child name
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Construct an `InvalidOperation` error
    pub(crate) fn invalid_op(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// Construct a `MalformedResponse`, flattening the body to one line
    pub(crate) fn malformed(body: impl Into<String>) -> Self {
        let body = body.into().trim().replace('\r', "").replace('\n', " ");
        Error::MalformedResponse { body }
    }

    /// Construct a `Config` error without a key
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: None,
        }
    }
}
