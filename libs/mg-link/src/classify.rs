//! Failure classification.
//!
//! Every failure goes through [`Classifier::classify`]. Structured signals
//! (GraphQL error codes, HTTP status, typed errors) decide first; message text
//! is only consulted when none of them applies.

use crate::error::LinkError;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// GraphQL error code of a document that does not match the schema
pub const CODE_VALIDATION_FAILED: &str = "GRAPHQL_VALIDATION_FAILED";
/// GraphQL error code of a missing or rejected credential
pub const CODE_UNAUTHENTICATED: &str = "UNAUTHENTICATED";
/// GraphQL error code of a backend that is down or overloaded
pub const CODE_SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";

/// Actionable category of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClassification {
    ValidationFailure,
    Unauthenticated,
    ServiceUnavailable,
    Timeout,
    ConnectionRefused,
    Offline,
    UnknownNetwork,
    UnknownGraphql,
    Cancelled,
}

impl ErrorClassification {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailure => "validation-failure",
            Self::Unauthenticated => "unauthenticated",
            Self::ServiceUnavailable => "service-unavailable",
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection-refused",
            Self::Offline => "offline",
            Self::UnknownNetwork => "unknown-network",
            Self::UnknownGraphql => "unknown-graphql",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared online/offline flag.
///
/// The embedding application flips it from whatever connectivity signal it
/// has. While offline, failures without a structured cause classify as
/// [`ErrorClassification::Offline`].
#[derive(Debug, Clone)]
pub struct Connectivity(Arc<AtomicBool>);

impl Default for Connectivity {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl Connectivity {
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::Relaxed);
    }
}

/// Maps failures to [`ErrorClassification`]
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    connectivity: Connectivity,
}

impl Classifier {
    #[must_use]
    pub fn new(connectivity: Connectivity) -> Self {
        Self { connectivity }
    }

    #[must_use]
    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Classify a failure.
    ///
    /// Priority:
    /// 1. GraphQL `extensions.code` on any error, then HTTP 401/503, then
    ///    typed cancellation and timeout
    /// 2. the connectivity flag
    /// 3. the network-level error chain's messages (`timeout`, `timed out`,
    ///    `ECONNREFUSED`, `connection refused`), case-insensitive. GraphQL
    ///    error text never takes part.
    /// 4. `unknown-graphql` when GraphQL errors were present, `unknown-network`
    ///    otherwise
    #[must_use]
    pub fn classify(&self, error: &LinkError) -> ErrorClassification {
        if let Some(class) = classify_structured(error) {
            return class;
        }

        if !self.connectivity.is_online() {
            return ErrorClassification::Offline;
        }

        if let Some(class) = network_chain_text(error).and_then(|text| classify_message(&text)) {
            return class;
        }

        if error.graphql_errors().is_empty() {
            ErrorClassification::UnknownNetwork
        } else {
            ErrorClassification::UnknownGraphql
        }
    }
}

fn classify_structured(error: &LinkError) -> Option<ErrorClassification> {
    let errors = error.graphql_errors();
    for (code, class) in [
        (CODE_VALIDATION_FAILED, ErrorClassification::ValidationFailure),
        (CODE_UNAUTHENTICATED, ErrorClassification::Unauthenticated),
        (CODE_SERVICE_UNAVAILABLE, ErrorClassification::ServiceUnavailable),
    ] {
        if errors.iter().any(|e| e.code() == Some(code)) {
            return Some(class);
        }
    }

    match error {
        LinkError::HttpStatus { status, .. } if *status == http::StatusCode::UNAUTHORIZED => {
            Some(ErrorClassification::Unauthenticated)
        }
        LinkError::HttpStatus { status, .. }
            if *status == http::StatusCode::SERVICE_UNAVAILABLE =>
        {
            Some(ErrorClassification::ServiceUnavailable)
        }
        LinkError::Document(_) | LinkError::WrongOperationKind { .. } => {
            Some(ErrorClassification::ValidationFailure)
        }
        LinkError::Cancelled => Some(ErrorClassification::Cancelled),
        LinkError::Timeout(_) => Some(ErrorClassification::Timeout),
        LinkError::StreamReconnectExhausted { last, .. } => classify_structured(last),
        _ => None,
    }
}

/// Message-pattern fallback
fn classify_message(text: &str) -> Option<ErrorClassification> {
    let text = text.to_ascii_lowercase();
    if text.contains("timeout") || text.contains("timed out") {
        return Some(ErrorClassification::Timeout);
    }
    if text.contains("econnrefused") || text.contains("connection refused") {
        return Some(ErrorClassification::ConnectionRefused);
    }
    None
}

/// Display text of a network-level error and all of its sources.
///
/// `None` when the failure carries GraphQL errors: resolver messages are
/// classified by code only.
fn network_chain_text(error: &LinkError) -> Option<String> {
    match error {
        LinkError::GraphQL { .. } => return None,
        LinkError::StreamReconnectExhausted { last, .. } => return network_chain_text(last),
        _ if !error.graphql_errors().is_empty() => return None,
        _ => {}
    }

    let mut text = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(err) = source {
        text.push('\n');
        text.push_str(&err.to_string());
        source = err.source();
    }
    Some(text)
}

/// Alternatives offered by a validation message:
/// `Did you mean "A", "B", or "C"?` yields `["A", "B", "C"]`.
#[must_use]
pub fn suggestions(message: &str) -> Vec<String> {
    let Some(start) = message.find("Did you mean") else {
        return Vec::new();
    };
    let hint = &message[start..];
    let hint = hint.find('?').map_or(hint, |end| &hint[..end]);

    hint.split('"')
        .skip(1)
        .step_by(2)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::response::GraphQLError;
    use std::time::Duration;

    fn classify(error: &LinkError) -> ErrorClassification {
        Classifier::default().classify(error)
    }

    fn graphql(errors: Vec<GraphQLError>) -> LinkError {
        LinkError::GraphQL { errors }
    }

    fn transport(message: &str) -> LinkError {
        LinkError::Transport(message.into())
    }

    fn status(code: u16, errors: Vec<GraphQLError>) -> LinkError {
        LinkError::HttpStatus {
            status: http::StatusCode::from_u16(code).unwrap(),
            body_preview: String::new(),
            errors,
            retry_after: None,
        }
    }

    #[test]
    fn test_graphql_codes() {
        let cases = [
            (CODE_VALIDATION_FAILED, ErrorClassification::ValidationFailure),
            (CODE_UNAUTHENTICATED, ErrorClassification::Unauthenticated),
            (CODE_SERVICE_UNAVAILABLE, ErrorClassification::ServiceUnavailable),
        ];
        for (code, expected) in cases {
            let err = graphql(vec![GraphQLError::new("x").with_code(code)]);
            assert_eq!(classify(&err), expected, "code {code}");
        }
    }

    #[test]
    fn test_code_found_on_any_error() {
        let err = graphql(vec![
            GraphQLError::new("first"),
            GraphQLError::new("second").with_code(CODE_UNAUTHENTICATED),
        ]);
        assert_eq!(classify(&err), ErrorClassification::Unauthenticated);
    }

    #[test]
    fn test_validation_code_outranks_other_codes() {
        let err = graphql(vec![
            GraphQLError::new("a").with_code(CODE_SERVICE_UNAVAILABLE),
            GraphQLError::new("b").with_code(CODE_VALIDATION_FAILED),
        ]);
        assert_eq!(classify(&err), ErrorClassification::ValidationFailure);
    }

    #[test]
    fn test_code_outranks_message() {
        let err = graphql(vec![
            GraphQLError::new("upstream timeout").with_code(CODE_UNAUTHENTICATED),
        ]);
        assert_eq!(classify(&err), ErrorClassification::Unauthenticated);
    }

    #[test]
    fn test_code_inside_http_error_body() {
        let err = status(
            400,
            vec![GraphQLError::new("bad").with_code(CODE_VALIDATION_FAILED)],
        );
        assert_eq!(classify(&err), ErrorClassification::ValidationFailure);
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            classify(&status(401, Vec::new())),
            ErrorClassification::Unauthenticated
        );
        assert_eq!(
            classify(&status(503, Vec::new())),
            ErrorClassification::ServiceUnavailable
        );
        assert_eq!(
            classify(&status(500, Vec::new())),
            ErrorClassification::UnknownNetwork
        );
        assert_eq!(
            classify(&status(502, vec![GraphQLError::new("upstream")])),
            ErrorClassification::UnknownGraphql
        );
    }

    #[test]
    fn test_typed_variants() {
        assert_eq!(
            classify(&LinkError::Cancelled),
            ErrorClassification::Cancelled
        );
        assert_eq!(
            classify(&LinkError::Timeout(Duration::from_secs(30))),
            ErrorClassification::Timeout
        );
    }

    #[test]
    fn test_local_document_errors_are_validation_failures() {
        assert_eq!(
            classify(&LinkError::Document(crate::document::DocumentError::Empty)),
            ErrorClassification::ValidationFailure
        );
        assert_eq!(
            classify(&LinkError::WrongOperationKind {
                expected: crate::document::OperationKind::Mutation,
                actual: crate::document::OperationKind::Query,
            }),
            ErrorClassification::ValidationFailure
        );
    }

    #[test]
    fn test_message_patterns() {
        let cases = [
            ("operation timeout", ErrorClassification::Timeout),
            ("Request TIMED OUT", ErrorClassification::Timeout),
            ("Timeout awaiting response headers", ErrorClassification::Timeout),
            ("connect ECONNREFUSED 127.0.0.1:3000", ErrorClassification::ConnectionRefused),
            ("tcp connect error: Connection refused (os error 111)", ErrorClassification::ConnectionRefused),
            ("dns error: failed to lookup address", ErrorClassification::UnknownNetwork),
            ("", ErrorClassification::UnknownNetwork),
        ];
        for (message, expected) in cases {
            assert_eq!(classify(&transport(message)), expected, "message {message:?}");
        }
    }

    #[test]
    fn test_message_pattern_in_graphql_error_text() {
        let err = graphql(vec![GraphQLError::new("gateway: upstream timed out")]);
        assert_eq!(classify(&err), ErrorClassification::UnknownGraphql);

        let err = graphql(vec![GraphQLError::new("connect ECONNREFUSED 10.0.0.4:5432")]);
        assert_eq!(classify(&err), ErrorClassification::UnknownGraphql);
    }

    #[test]
    fn test_message_pattern_ignores_errors_parsed_from_http_body() {
        let err = LinkError::HttpStatus {
            status: http::StatusCode::BAD_GATEWAY,
            body_preview: String::new(),
            errors: vec![GraphQLError::new("Repository scan timed out")],
            retry_after: None,
        };
        assert_eq!(classify(&err), ErrorClassification::UnknownGraphql);
    }

    #[test]
    fn test_message_pattern_in_plain_http_status_body() {
        let err = LinkError::HttpStatus {
            status: http::StatusCode::GATEWAY_TIMEOUT,
            body_preview: "upstream request timeout".to_owned(),
            errors: Vec::new(),
            retry_after: None,
        };
        assert_eq!(classify(&err), ErrorClassification::Timeout);
    }

    #[test]
    fn test_reconnect_exhausted_after_graphql_failure() {
        let err = LinkError::StreamReconnectExhausted {
            attempts: 5,
            last: Box::new(graphql(vec![GraphQLError::new("resolver timed out")])),
        };
        assert_eq!(classify(&err), ErrorClassification::UnknownGraphql);

        let err = LinkError::StreamReconnectExhausted {
            attempts: 5,
            last: Box::new(transport("connection refused")),
        };
        assert_eq!(classify(&err), ErrorClassification::ConnectionRefused);
    }

    #[test]
    fn test_message_pattern_in_error_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let err = LinkError::Transport(Box::new(inner));
        assert_eq!(classify(&err), ErrorClassification::ConnectionRefused);
    }

    #[test]
    fn test_offline_flag() {
        let connectivity = Connectivity::default();
        let classifier = Classifier::new(connectivity.clone());
        connectivity.set_online(false);

        assert_eq!(
            classifier.classify(&transport("connection refused")),
            ErrorClassification::Offline
        );
        // Structured signals still win
        assert_eq!(
            classifier.classify(&status(401, Vec::new())),
            ErrorClassification::Unauthenticated
        );

        connectivity.set_online(true);
        assert_eq!(
            classifier.classify(&transport("connection refused")),
            ErrorClassification::ConnectionRefused
        );
    }

    #[test]
    fn test_unknown_defaults() {
        assert_eq!(
            classify(&graphql(vec![GraphQLError::new("Repository not found")])),
            ErrorClassification::UnknownGraphql
        );
        assert_eq!(
            classify(&LinkError::BodyTooLarge { limit: 1, actual: 2 }),
            ErrorClassification::UnknownNetwork
        );
    }

    #[test]
    fn test_reconnect_exhausted_uses_last_error() {
        let err = LinkError::StreamReconnectExhausted {
            attempts: 3,
            last: Box::new(status(503, Vec::new())),
        };
        assert_eq!(classify(&err), ErrorClassification::ServiceUnavailable);
    }

    #[test]
    fn test_suggestions() {
        assert_eq!(
            suggestions(r#"Unknown type "Repo". Did you mean "Repository", "RepositoryStatus", or "Report"?"#),
            vec!["Repository", "RepositoryStatus", "Report"]
        );
        assert_eq!(
            suggestions(r#"Cannot query field "brnch" on type "Repository". Did you mean "branch"?"#),
            vec!["branch"]
        );
        assert!(suggestions("Syntax Error: Unexpected Name").is_empty());
    }

    #[test]
    fn test_classification_names() {
        assert_eq!(ErrorClassification::UnknownGraphql.to_string(), "unknown-graphql");
        assert_eq!(
            serde_json::to_value(ErrorClassification::ConnectionRefused).unwrap(),
            "connection-refused"
        );
    }
}
