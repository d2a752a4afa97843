use std::backtrace::Backtrace;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use super::{Method, ResponseBody};

/// Boxed error returned by a [`Transport`](crate::Transport) implementation
pub type TransportError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Possible errors when dispatching requests with `bucketeer_lib`
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The caller asked for a verb the remote API does not support.
    /// Raised before any network activity.
    #[error("Invalid method \"{0}\"")]
    InvalidMethod(String),

    /// The transport call did not complete within the configured timeout
    #[error("Request timed out (>{}ms) on {method} {path}", .timeout.as_millis())]
    Timeout {
        /// The configured per-request timeout
        timeout: Duration,
        /// Method of the request
        method: Method,
        /// Path of the request
        path: String,
    },

    /// The server kept answering 502 until the retry cap was reached
    #[error("{error} (gave up after {attempts} attempts)")]
    TransientServerError {
        /// Number of 502 responses seen, including the final one. Rate
        /// limited attempts in between are not counted.
        attempts: usize,
        /// The final 502 response
        error: Box<HttpError>,
    },

    /// The server rejected the request with a machine-readable error payload
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The server rejected the request without a structured payload
    #[error(transparent)]
    Http(#[from] HttpError),

    /// A response declared as JSON could not be parsed. Never returned from a
    /// request; only reported through events and the log
    #[error("Failed to parse JSON response body on {method} {route}")]
    BodyParse {
        /// Method of the request
        method: Method,
        /// Route key of the request
        route: String,
        /// The underlying parse error
        #[source]
        source: serde_json::Error,
    },

    /// The transport collaborator failed before a response arrived
    #[error("Transport error on {method} {path}: {source}")]
    Transport {
        /// Method of the request
        method: Method,
        /// Path of the request
        path: String,
        /// What the transport reported
        #[source]
        source: TransportError,
    },

    /// The JSON request body could not be serialized
    #[error("Cannot serialize request body")]
    Serialize(#[source] serde_json::Error),

    /// A configured or computed header value is not a legal header value
    #[error("Header could not be parsed.")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// The configured base URL does not parse
    #[error("Invalid base URL `{0}`: {1}")]
    InvalidBaseUrl(String, #[source] url::ParseError),

    /// The default transport's HTTP client could not be built
    #[error("Error creating request client: {0}")]
    BuildRequestClient(#[source] reqwest::Error),

    /// A file attachment could not be read from disk
    #[error("Failed to read attachment `{path}`: {1}", path = .0.display())]
    ReadAttachment(PathBuf, #[source] std::io::Error),
}

impl ErrorKind {
    /// The HTTP status the server answered with, for errors that carry one
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Api(e) => Some(e.status),
            Self::Http(e) => Some(e.status),
            Self::TransientServerError { error, .. } => Some(error.status),
            _ => None,
        }
    }
}

/// A rejection whose body carries a machine-readable error `code`
#[derive(Error, Debug, Clone)]
#[error("{message} ({code}) on {method} {path} [{status}]")]
pub struct ApiError {
    /// Status of the response
    pub status: StatusCode,
    /// Error code from the payload
    pub code: i64,
    /// Human readable message from the payload
    pub message: String,
    /// Method of the request
    pub method: Method,
    /// Path of the request
    pub path: String,
    /// Route key of the request
    pub route: String,
    /// The full error payload
    pub body: serde_json::Value,
    /// Where `request()` was called from
    pub call_site: Arc<Backtrace>,
}

/// A rejection without a structured error payload
#[derive(Error, Debug, Clone)]
#[error("{status} on {method} {path}")]
pub struct HttpError {
    /// Status of the response
    pub status: StatusCode,
    /// Method of the request
    pub method: Method,
    /// Path of the request
    pub path: String,
    /// Route key of the request
    pub route: String,
    /// Whatever body the server sent
    pub body: ResponseBody,
    /// Where `request()` was called from
    pub call_site: Arc<Backtrace>,
}
