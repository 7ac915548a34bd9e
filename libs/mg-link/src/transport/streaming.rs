//! Subscriptions over server-sent events.
//!
//! The service call opens the first connection and hands back a
//! [`Subscription`]. From then on a single session task owns the connection:
//! it decodes frames, forwards results in order through a bounded channel and
//! reconnects when the connection drops before the server completes.

use crate::config::StreamConfig;
use crate::error::{LinkError, OperationError};
use crate::layers::{Reporter, calculate_backoff, is_retryable};
use crate::operation::Operation;
use crate::response::{GraphQLResponse, ResponseMeta};
use crate::transport::sse::{FrameDecoder, FrameKind};
use crate::transport::stack::{self, HttpService, ResponseBody, read_body_limited, status_error};
use async_trait::async_trait;
use futures_core::Stream;
use http::Uri;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http_body_util::BodyExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing::Instrument;

const ACCEPT_EVENT_STREAM: &str = "text/event-stream";
const LAST_EVENT_ID: &str = "last-event-id";

/// One item of a subscription: a result or an in-stream failure
pub type SubscriptionItem = Result<GraphQLResponse, OperationError>;

/// Opens event-stream connections for a subscription operation
#[async_trait]
pub trait EventStreamConnector: Send + Sync {
    /// Open a connection. `last_event_id` is set when resuming after a drop.
    async fn open(
        &self,
        operation: &Operation,
        last_event_id: Option<&str>,
    ) -> Result<ResponseBody, LinkError>;
}

/// Opens streams with a POST to the gateway's stream endpoint
#[derive(Clone)]
pub struct HttpEventStreamConnector {
    http: HttpService,
    endpoint: Uri,
    headers: Arc<HeaderMap>,
    max_body_size: usize,
}

impl HttpEventStreamConnector {
    #[must_use]
    pub fn new(http: HttpService, endpoint: Uri, headers: Arc<HeaderMap>, max_body_size: usize) -> Self {
        Self {
            http,
            endpoint,
            headers,
            max_body_size,
        }
    }
}

#[async_trait]
impl EventStreamConnector for HttpEventStreamConnector {
    async fn open(
        &self,
        operation: &Operation,
        last_event_id: Option<&str>,
    ) -> Result<ResponseBody, LinkError> {
        let mut request =
            stack::post(&self.endpoint, &self.headers, ACCEPT_EVENT_STREAM, operation.to_body()?)?;
        if let Some(id) = last_event_id {
            request
                .headers_mut()
                .insert(HeaderName::from_static(LAST_EVENT_ID), HeaderValue::from_str(id)?);
        }

        let response = self.http.clone().oneshot(request).await?;
        if !response.status().is_success() {
            return Err(status_error(response, self.max_body_size).await);
        }

        let is_event_stream = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with(ACCEPT_EVENT_STREAM));
        if is_event_stream {
            return Ok(response.into_body());
        }

        // Gateways reject a subscription up front with a plain GraphQL response
        let body = read_body_limited(response.into_body(), self.max_body_size).await?;
        GraphQLResponse::from_slice(&body)?.into_result()?;
        Err(LinkError::Transport(
            "gateway answered a subscription without an event stream".into(),
        ))
    }
}

/// Transport for subscription operations
#[derive(Clone)]
pub struct StreamingTransport {
    connector: Arc<dyn EventStreamConnector>,
    config: StreamConfig,
    reporter: Reporter,
}

impl std::fmt::Debug for StreamingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StreamingTransport {
    /// `reporter` receives failures that happen after the subscription started
    #[must_use]
    pub fn new(connector: Arc<dyn EventStreamConnector>, config: StreamConfig, reporter: Reporter) -> Self {
        Self {
            connector,
            config,
            reporter,
        }
    }
}

impl Service<Operation> for StreamingTransport {
    type Response = Subscription;
    type Error = LinkError;
    type Future = Pin<Box<dyn Future<Output = Result<Subscription, LinkError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, operation: Operation) -> Self::Future {
        let connector = Arc::clone(&self.connector);
        let config = self.config.clone();
        let reporter = self.reporter.clone();

        Box::pin(async move {
            let token = operation.cancellation().child_token();
            let body = tokio::select! {
                biased;
                () = token.cancelled() => return Err(LinkError::Cancelled),
                opened = connector.open(&operation, None) => opened?,
            };

            let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
            let name = operation.display_name().to_owned();
            let span = tracing::debug_span!("subscription", operation = %name);
            let session = Session {
                decoder: FrameDecoder::new(config.max_frame_bytes),
                name: name.clone(),
                operation,
                connector,
                config,
                reporter,
                sender,
                token: token.clone(),
            };
            tokio::spawn(session.run(body).instrument(span));

            Ok(Subscription::new(name, receiver, token))
        })
    }
}

enum Pump {
    /// Completed by the server, cancelled, or the subscriber went away
    Finished,
    /// The connection dropped before completion
    Lost(LinkError),
}

/// Producer side of one subscription
struct Session {
    operation: Operation,
    name: String,
    connector: Arc<dyn EventStreamConnector>,
    config: StreamConfig,
    reporter: Reporter,
    decoder: FrameDecoder,
    sender: mpsc::Sender<SubscriptionItem>,
    token: CancellationToken,
}

impl Session {
    async fn run(mut self, mut body: ResponseBody) {
        let reconnect = self.config.reconnect.clone();
        let mut failures = 0usize;

        loop {
            let connected_at = Instant::now();
            let lost = match self.pump(&mut body).await {
                Pump::Finished => break,
                Pump::Lost(err) => err,
            };

            if connected_at.elapsed() >= reconnect.stable_after {
                failures = 0;
            }
            tracing::warn!(error = %lost, failures, "event stream lost, reconnecting");

            let mut last = lost;
            body = loop {
                if failures >= reconnect.max_attempts {
                    let err = LinkError::StreamReconnectExhausted {
                        attempts: failures,
                        last: Box::new(last),
                    };
                    self.fail(err).await;
                    return;
                }
                failures += 1;

                let delay = self.decoder.retry_hint().map_or_else(
                    || calculate_backoff(&reconnect.backoff, failures - 1),
                    |hint| hint.min(reconnect.backoff.max),
                );
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }

                self.decoder.reset();
                let opened = tokio::select! {
                    biased;
                    () = self.token.cancelled() => return,
                    opened = self.connector.open(&self.operation, self.decoder.last_event_id()) => opened,
                };
                match opened {
                    Ok(body) => {
                        tracing::debug!(attempt = failures, "event stream reconnected");
                        break body;
                    }
                    Err(err) => {
                        let classification = self.reporter.report(&self.name, &err);
                        if !is_retryable(classification) {
                            self.deliver(Err(OperationError::new(err, classification, self.name.clone())))
                                .await;
                            return;
                        }
                        last = err;
                    }
                }
            };
        }
        tracing::debug!(corrupt_frames = self.decoder.corrupt_frames(), "subscription finished");
    }

    /// Read the connection until it ends
    async fn pump(&mut self, body: &mut ResponseBody) -> Pump {
        loop {
            let frame = tokio::select! {
                biased;
                () = self.token.cancelled() => return Pump::Finished,
                frame = body.frame() => frame,
            };

            let chunk = match frame {
                None => {
                    return Pump::Lost(LinkError::Transport(
                        "event stream ended before completion".into(),
                    ));
                }
                Some(Err(err)) => return Pump::Lost(LinkError::Transport(err)),
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(chunk) => chunk,
                    Err(_) => continue,
                },
            };

            for frame in self.decoder.push(&chunk) {
                match frame.kind() {
                    FrameKind::Complete => return Pump::Finished,
                    FrameKind::Next => {
                        if !self.forward(frame.data.as_deref().unwrap_or_default()).await {
                            return Pump::Finished;
                        }
                    }
                    FrameKind::Other => {
                        tracing::trace!(event = ?frame.event, "ignoring event frame");
                    }
                }
            }
        }
    }

    /// Parse one payload and deliver it. Returns false once nobody listens.
    async fn forward(&self, payload: &str) -> bool {
        let response = match GraphQLResponse::from_slice(payload.as_bytes()) {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed event payload");
                return true;
            }
        };

        match response.into_result() {
            Ok(response) => self.deliver(Ok(response)).await,
            Err(err) => {
                let classification = self.reporter.report(&self.name, &err);
                self.deliver(Err(OperationError::new(err, classification, self.name.clone())))
                    .await
            }
        }
    }

    async fn fail(&self, err: LinkError) {
        let classification = self.reporter.report(&self.name, &err);
        self.deliver(Err(OperationError::new(err, classification, self.name.clone())))
            .await;
    }

    async fn deliver(&self, item: SubscriptionItem) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = self.token.cancelled() => false,
            sent = self.sender.send(item) => sent.is_ok(),
        }
    }
}

type Observer = Arc<dyn Fn(&GraphQLResponse) + Send + Sync>;

/// A live subscription.
///
/// Yields results in the order the server sent them. After cancellation
/// (explicit, through the operation's token, by client shutdown, or by
/// dropping the subscription) it yields `None`, even if results were still
/// buffered.
pub struct Subscription {
    operation: String,
    receiver: mpsc::Receiver<SubscriptionItem>,
    cancellation: CancellationToken,
    meta: ResponseMeta,
    observer: Option<Observer>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("operation", &self.operation)
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Wrap a receiver fed by a producer that stops when `cancellation` fires
    #[must_use]
    pub fn new(
        operation: impl Into<String>,
        receiver: mpsc::Receiver<SubscriptionItem>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            operation: operation.into(),
            receiver,
            cancellation,
            meta: ResponseMeta::default(),
            observer: None,
        }
    }

    /// Call `observer` with every successful result before it is yielded
    #[must_use]
    pub fn with_observer(mut self, observer: impl Fn(&GraphQLResponse) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Next item, or `None` once the subscription ended or was cancelled
    pub async fn recv(&mut self) -> Option<SubscriptionItem> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Stop the subscription. Calling it again is a no-op.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Setup timing; `duration` covers opening the stream, retries included
    #[must_use]
    pub fn meta(&self) -> &ResponseMeta {
        &self.meta
    }

    pub(crate) fn meta_mut(&mut self) -> &mut ResponseMeta {
        &mut self.meta
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl Stream for Subscription {
    type Item = SubscriptionItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancellation.is_cancelled() {
            return Poll::Ready(None);
        }
        let item = ready!(self.receiver.poll_recv(cx));
        if let (Some(Ok(response)), Some(observer)) = (&item, &self.observer) {
            observer(response);
        }
        Poll::Ready(item)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}
