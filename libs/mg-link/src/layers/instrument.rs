use crate::error::OperationError;
use crate::events::{EventBus, LinkEvent};
use crate::operation::Operation;
use crate::transport::Execution;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower::{Layer, Service};

/// Outermost layer: measures each caller request end to end, retries included
#[derive(Debug, Clone)]
pub struct InstrumentLayer {
    threshold: Duration,
    events: EventBus,
}

impl InstrumentLayer {
    #[must_use]
    pub fn new(threshold: Duration, events: EventBus) -> Self {
        Self { threshold, events }
    }
}

impl<S> Layer<S> for InstrumentLayer {
    type Service = InstrumentService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InstrumentService {
            inner,
            threshold: self.threshold,
            events: self.events.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentService<S> {
    inner: S,
    threshold: Duration,
    events: EventBus,
}

impl<S> Service<Operation> for InstrumentService<S>
where
    S: Service<Operation, Response = Execution, Error = OperationError>,
    S::Future: Send + 'static,
{
    type Response = Execution;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<Execution, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, operation: Operation) -> Self::Future {
        let name = operation.display_name().to_owned();
        let kind = operation.kind();
        let threshold = self.threshold;
        let events = self.events.clone();
        let started = Instant::now();
        let future = self.inner.call(operation);

        Box::pin(async move {
            let mut result = future.await;
            let duration = started.elapsed();
            let slow = duration > threshold;

            let meta = match &mut result {
                Ok(execution) => execution.meta_mut(),
                Err(err) => &mut err.meta,
            };
            meta.duration = Some(duration);
            meta.slow = slow;

            if slow {
                tracing::warn!(
                    operation = %name,
                    kind = %kind,
                    duration_ms = duration.as_millis(),
                    threshold_ms = threshold.as_millis(),
                    "Slow GraphQL operation"
                );
                events.emit(LinkEvent::SlowOperation {
                    operation: name,
                    duration,
                    threshold,
                });
            } else {
                tracing::trace!(operation = %name, duration_ms = duration.as_millis(), "operation finished");
            }

            result
        })
    }
}
