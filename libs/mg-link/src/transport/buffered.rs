use crate::error::LinkError;
use crate::operation::Operation;
use crate::response::GraphQLResponse;
use crate::transport::stack::{self, HttpService, read_body_limited, status_error};
use http::header::HeaderMap;
use http::Uri;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Service, ServiceExt};

const ACCEPT_GRAPHQL: &str = "application/graphql-response+json, application/json";

/// Request/response transport for queries and mutations.
///
/// One `call` is one attempt: a JSON POST, a size-limited body read and a
/// parse. Retries belong to the layers above.
#[derive(Clone)]
pub struct BufferedTransport {
    http: HttpService,
    endpoint: Uri,
    headers: Arc<HeaderMap>,
    max_body_size: usize,
    timeout: Duration,
}

impl std::fmt::Debug for BufferedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedTransport")
            .field("endpoint", &self.endpoint)
            .field("max_body_size", &self.max_body_size)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl BufferedTransport {
    /// `timeout` bounds the whole attempt, body read included
    #[must_use]
    pub fn new(
        http: HttpService,
        endpoint: Uri,
        headers: Arc<HeaderMap>,
        max_body_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            endpoint,
            headers,
            max_body_size,
            timeout,
        }
    }

    async fn exchange(
        http: HttpService,
        endpoint: Uri,
        headers: Arc<HeaderMap>,
        max_body_size: usize,
        operation: &Operation,
    ) -> Result<GraphQLResponse, LinkError> {
        let request = stack::post(&endpoint, &headers, ACCEPT_GRAPHQL, operation.to_body()?)?;
        let response = http.oneshot(request).await?;

        if !response.status().is_success() {
            return Err(status_error(response, max_body_size).await);
        }

        let body = read_body_limited(response.into_body(), max_body_size).await?;
        GraphQLResponse::from_slice(&body)?.into_result()
    }
}

impl Service<Operation> for BufferedTransport {
    type Response = GraphQLResponse;
    type Error = LinkError;
    type Future = Pin<Box<dyn Future<Output = Result<GraphQLResponse, LinkError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, operation: Operation) -> Self::Future {
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        let headers = Arc::clone(&self.headers);
        let max_body_size = self.max_body_size;
        let timeout = self.timeout;

        Box::pin(async move {
            let cancellation = operation.cancellation().clone();
            let exchange = Self::exchange(http, endpoint, headers, max_body_size, &operation);

            tokio::select! {
                biased;
                () = cancellation.cancelled() => Err(LinkError::Cancelled),
                result = tokio::time::timeout(timeout, exchange) => {
                    result.unwrap_or_else(|_| Err(LinkError::Timeout(timeout)))
                }
            }
        })
    }
}
