use crate::document::OperationKind;
use crate::error::LinkError;
use crate::operation::Operation;
use crate::response::GraphQLResponse;
use crate::transport::{Execution, Subscription};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Service, ServiceExt};

/// Which transport carries an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Buffered,
    Streaming,
}

/// Subscriptions stream; queries and mutations are buffered
#[must_use]
pub fn route(kind: OperationKind) -> Route {
    match kind {
        OperationKind::Subscription => Route::Streaming,
        OperationKind::Query | OperationKind::Mutation => Route::Buffered,
    }
}

/// Dispatches each operation to the buffered or the streaming transport.
///
/// Does nothing else: no retries and no reporting.
#[derive(Debug, Clone)]
pub struct TransportSelector<B, S> {
    buffered: B,
    streaming: S,
}

impl<B, S> TransportSelector<B, S> {
    #[must_use]
    pub fn new(buffered: B, streaming: S) -> Self {
        Self {
            buffered,
            streaming,
        }
    }
}

impl<B, S> Service<Operation> for TransportSelector<B, S>
where
    B: Service<Operation, Response = GraphQLResponse, Error = LinkError> + Clone + Send + 'static,
    B::Future: Send,
    S: Service<Operation, Response = Subscription, Error = LinkError> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Execution;
    type Error = LinkError;
    type Future = Pin<Box<dyn Future<Output = Result<Execution, LinkError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is checked on the chosen transport inside `call`
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, operation: Operation) -> Self::Future {
        let route = route(operation.kind());
        tracing::trace!(operation = operation.display_name(), ?route, "routing operation");

        match route {
            Route::Buffered => {
                let buffered = self.buffered.clone();
                Box::pin(async move { buffered.oneshot(operation).await.map(Execution::Response) })
            }
            Route::Streaming => {
                let streaming = self.streaming.clone();
                Box::pin(async move {
                    streaming
                        .oneshot(operation)
                        .await
                        .map(Execution::Subscription)
                })
            }
        }
    }
}
