use crate::classify::{self, Classifier, ErrorClassification};
use crate::error::LinkError;
use crate::events::{EventBus, LinkEvent};
use crate::operation::Operation;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Classifies failures and publishes them as [`LinkEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    classifier: Classifier,
    events: EventBus,
}

impl Reporter {
    #[must_use]
    pub fn new(classifier: Classifier, events: EventBus) -> Self {
        Self { classifier, events }
    }

    #[must_use]
    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Classify `error`, log it and emit the matching event.
    ///
    /// Cancellation is returned but never logged or emitted.
    pub fn report(&self, operation: &str, error: &LinkError) -> ErrorClassification {
        let classification = self.classifier.classify(error);
        if classification == ErrorClassification::Cancelled {
            return classification;
        }

        tracing::warn!(
            operation,
            classification = %classification,
            error = %error,
            "GraphQL operation failed"
        );
        self.events.emit(event_for(operation, classification, error));
        classification
    }
}

fn event_for(operation: &str, classification: ErrorClassification, error: &LinkError) -> LinkEvent {
    let operation = operation.to_owned();
    let message = error.to_string();
    match classification {
        ErrorClassification::ValidationFailure => {
            let errors = error.graphql_errors();
            let message = errors
                .iter()
                .find(|e| e.code() == Some(classify::CODE_VALIDATION_FAILED))
                .or_else(|| errors.first())
                .map_or(message, |e| e.message.clone());
            let mut suggestions: Vec<String> = Vec::new();
            for e in errors {
                for suggestion in classify::suggestions(&e.message) {
                    if !suggestions.contains(&suggestion) {
                        suggestions.push(suggestion);
                    }
                }
            }
            LinkEvent::ValidationFailed {
                operation,
                message,
                suggestions,
            }
        }
        ErrorClassification::Unauthenticated => LinkEvent::Unauthenticated { operation, message },
        ErrorClassification::ServiceUnavailable => {
            LinkEvent::ServiceUnavailable { operation, message }
        }
        ErrorClassification::Timeout => LinkEvent::Timeout { operation, message },
        ErrorClassification::ConnectionRefused => {
            LinkEvent::ConnectionRefused { operation, message }
        }
        ErrorClassification::Offline => LinkEvent::Offline { operation },
        ErrorClassification::UnknownNetwork
        | ErrorClassification::UnknownGraphql
        | ErrorClassification::Cancelled => LinkEvent::UnknownError {
            operation,
            classification,
            message,
        },
    }
}

/// Layer reporting every failed attempt of the wrapped service
#[derive(Debug, Clone)]
pub struct ReportLayer {
    reporter: Reporter,
}

impl ReportLayer {
    #[must_use]
    pub fn new(reporter: Reporter) -> Self {
        Self { reporter }
    }
}

impl<S> Layer<S> for ReportLayer {
    type Service = ReportService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ReportService {
            inner,
            reporter: self.reporter.clone(),
        }
    }
}

/// Passes results through unchanged after reporting failures
#[derive(Debug, Clone)]
pub struct ReportService<S> {
    inner: S,
    reporter: Reporter,
}

impl<S> Service<Operation> for ReportService<S>
where
    S: Service<Operation, Error = LinkError>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = LinkError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, LinkError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, operation: Operation) -> Self::Future {
        let name = operation.display_name().to_owned();
        let reporter = self.reporter.clone();
        let future = self.inner.call(operation);

        Box::pin(async move {
            let result = future.await;
            if let Err(err) = &result {
                reporter.report(&name, err);
            }
            result
        })
    }
}
