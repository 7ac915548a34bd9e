use crate::classify::ErrorClassification;
use crate::document::{DocumentError, OperationKind};
use crate::response::{GraphQLError, ResponseMeta};
use std::time::Duration;
use thiserror::Error;

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

/// Failure of a single pipeline attempt
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LinkError {
    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Operation document could not be inspected
    #[error("Invalid operation document: {0}")]
    Document(#[from] DocumentError),

    /// The document defines a different kind of operation than was requested
    #[error("Expected a {expected} operation, document defines a {actual}")]
    WrongOperationKind {
        expected: OperationKind,
        actual: OperationKind,
    },

    /// Cache policy rejected at build time
    #[error("Invalid cache policy: {0}")]
    CachePolicy(#[from] mg_cache::CacheError),

    /// Single attempt timed out
    #[error("Request attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Transport error (network, connection, etc)
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// HTTP non-2xx status
    #[error("HTTP {status}: {body_preview}")]
    HttpStatus {
        status: http::StatusCode,
        body_preview: String,
        /// GraphQL errors carried by the error body, if it had any
        errors: Vec<GraphQLError>,
        /// Parsed `Retry-After` header value, if present and valid
        retry_after: Option<Duration>,
    },

    /// JSON parsing error
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The gateway answered with errors and no data
    #[error("GraphQL request failed: {}", join_messages(.errors))]
    GraphQL { errors: Vec<GraphQLError> },

    /// A streaming session lost its connection and could not get it back
    #[error("Stream reconnect failed after {attempts} attempts: {last}")]
    StreamReconnectExhausted {
        attempts: usize,
        #[source]
        last: Box<LinkError>,
    },

    /// The operation was cancelled by its caller or by client shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// Pipeline is no longer accepting operations
    #[error("Pipeline service closed")]
    ServiceClosed,

    /// Invalid URL
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        url: String,
        kind: InvalidUriKind,
        reason: String,
    },

    /// URL scheme not allowed by the transport security mode
    #[error("Invalid URL scheme '{scheme}': {reason}")]
    InvalidScheme { scheme: String, reason: String },
}

fn join_messages(errors: &[GraphQLError]) -> String {
    if errors.is_empty() {
        return "no error details".to_owned();
    }
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl LinkError {
    /// GraphQL errors carried by this failure, if any
    #[must_use]
    pub fn graphql_errors(&self) -> &[GraphQLError] {
        match self {
            Self::GraphQL { errors } | Self::HttpStatus { errors, .. } => errors,
            Self::StreamReconnectExhausted { last, .. } => last.graphql_errors(),
            _ => &[],
        }
    }

    /// HTTP status of the failed exchange, if the gateway answered
    #[must_use]
    pub fn status(&self) -> Option<http::StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Server-requested delay before the next attempt
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Failure reported to callers of the client.
///
/// Carries the final attempt's error unchanged together with its classification
/// and the timing collected by the pipeline.
#[derive(Error, Debug)]
#[error("{operation}: {error}")]
pub struct OperationError {
    #[source]
    pub error: LinkError,
    pub classification: ErrorClassification,
    /// Operation name, `<anonymous>` when the document has none
    pub operation: String,
    pub meta: ResponseMeta,
}

impl OperationError {
    #[must_use]
    pub fn new(
        error: LinkError,
        classification: ErrorClassification,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            error,
            classification,
            operation: operation.into(),
            meta: ResponseMeta::default(),
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.classification == ErrorClassification::Cancelled
    }
}
