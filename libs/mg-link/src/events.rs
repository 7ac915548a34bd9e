use crate::classify::ErrorClassification;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;

/// Observability signal emitted by the pipeline.
///
/// Events are fire-and-forget. They describe what happened to one attempt or
/// one operation and are never consumed by the pipeline itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum LinkEvent {
    /// The document does not match the schema
    ValidationFailed {
        operation: String,
        message: String,
        /// Alternatives parsed from "Did you mean" hints
        suggestions: Vec<String>,
    },
    Unauthenticated {
        operation: String,
        message: String,
    },
    ServiceUnavailable {
        operation: String,
        message: String,
    },
    Timeout {
        operation: String,
        message: String,
    },
    ConnectionRefused {
        operation: String,
        message: String,
    },
    Offline {
        operation: String,
    },
    UnknownError {
        operation: String,
        classification: ErrorClassification,
        message: String,
    },
    /// End-to-end duration exceeded the configured threshold
    SlowOperation {
        operation: String,
        #[serde(with = "crate::config::duration_serde")]
        duration: Duration,
        #[serde(with = "crate::config::duration_serde")]
        threshold: Duration,
    },
}

impl LinkEvent {
    /// Name of the operation the event is about
    #[must_use]
    pub fn operation(&self) -> &str {
        match self {
            Self::ValidationFailed { operation, .. }
            | Self::Unauthenticated { operation, .. }
            | Self::ServiceUnavailable { operation, .. }
            | Self::Timeout { operation, .. }
            | Self::ConnectionRefused { operation, .. }
            | Self::Offline { operation }
            | Self::UnknownError { operation, .. }
            | Self::SlowOperation { operation, .. } => operation,
        }
    }
}

/// Broadcast channel for [`LinkEvent`]s.
///
/// Emitting never blocks and never fails: with no subscribers the event is
/// dropped, and a subscriber that falls behind skips the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LinkEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Create a bus retaining up to `capacity` events per lagging subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: LinkEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("no event subscribers");
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
