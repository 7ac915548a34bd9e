use crate::builder::GatewayClientBuilder;
use crate::classify::{Connectivity, ErrorClassification};
use crate::document::OperationKind;
use crate::error::{LinkError, OperationError};
use crate::events::{EventBus, LinkEvent};
use crate::layers::Reporter;
use crate::operation::{ANONYMOUS_OPERATION, Operation};
use crate::response::GraphQLResponse;
use crate::transport::{Execution, Subscription};
use mg_cache::NormalizedCache;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower::buffer::Buffer;
use tower::{BoxError, Service, ServiceExt};

/// Future returned by the assembled pipeline
pub type PipelineFuture = Pin<Box<dyn Future<Output = Result<Execution, OperationError>> + Send>>;

/// Buffered pipeline shared by every clone of a [`GatewayClient`]
pub type PipelineService = Buffer<Operation, PipelineFuture>;

/// Where a query may be answered from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchPolicy {
    /// Answer from the cache when every root field is there, otherwise fetch
    /// and store
    #[default]
    CacheFirst,
    /// Always fetch, then store
    NetworkOnly,
    /// Always fetch, never store
    NoCache,
}

/// Client for the metaGOTHIC gateway
///
/// Built once at startup with [`GatewayClientBuilder`] and passed to whatever
/// needs it. `GatewayClient` is `Clone + Send + Sync`; clones share the
/// pipeline, the cache, the event bus and the shutdown signal.
///
/// # Example
///
/// ```ignore
/// let client = GatewayClient::builder()
///     .with_config(LinkConfig::for_gateway("http://localhost:3000/graphql"))
///     .build()?;
///
/// let op = client.operation("query Health { systemHealth { status } }")?;
/// let response = client.query(op).await?;
/// ```
#[derive(Clone)]
pub struct GatewayClient {
    pub(crate) service: PipelineService,
    pub(crate) cache: Arc<NormalizedCache>,
    pub(crate) reporter: Reporter,
    pub(crate) shutdown: CancellationToken,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("cached_records", &self.cache.len())
            .field("online", &self.connectivity().is_online())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl GatewayClient {
    #[must_use]
    pub fn builder() -> GatewayClientBuilder {
        GatewayClientBuilder::new()
    }

    /// Parse `document` into an operation that is cancelled on shutdown
    ///
    /// A rejected document is reported as a validation failure.
    ///
    /// # Errors
    /// Returns [`LinkError::Document`] if the document defines no operation.
    pub fn operation(&self, document: &str) -> Result<Operation, LinkError> {
        let operation = Operation::new(document)
            .map_err(|err| self.rejected(err.into(), ANONYMOUS_OPERATION))?;
        Ok(operation.with_cancellation(self.shutdown.child_token()))
    }

    /// Like [`GatewayClient::operation`], selecting the definition called `name`
    ///
    /// # Errors
    /// Returns [`LinkError::Document`] if no operation has that name.
    pub fn named_operation(&self, document: &str, name: &str) -> Result<Operation, LinkError> {
        let operation = Operation::named(document, name)
            .map_err(|err| self.rejected(err.into(), name))?;
        Ok(operation.with_cancellation(self.shutdown.child_token()))
    }

    /// Send any operation through the pipeline, bypassing the cache
    ///
    /// # Errors
    /// Returns the classified failure of the last attempt. After
    /// [`GatewayClient::shutdown`] every call fails as cancelled.
    pub async fn execute(&self, operation: Operation) -> Result<Execution, OperationError> {
        let name = operation.display_name().to_owned();
        if self.shutdown.is_cancelled() {
            return Err(self.fail(LinkError::Cancelled, &name));
        }

        let mut service = self.service.clone();
        let call = async move {
            service.ready().await?;
            service.call(operation).await
        };

        let result = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(self.fail(LinkError::Cancelled, &name)),
            result = call => result.map_err(|err| Self::map_buffer_error(err, &name)),
        };

        let execution = result?;
        if let Execution::Subscription(subscription) = &execution {
            self.link_to_shutdown(subscription);
        }
        Ok(execution)
    }

    /// Run a query with [`FetchPolicy::CacheFirst`]
    ///
    /// # Errors
    /// See [`GatewayClient::query_with`].
    pub async fn query(&self, operation: Operation) -> Result<GraphQLResponse, OperationError> {
        self.query_with(operation, FetchPolicy::CacheFirst).await
    }

    /// Run a query, consulting and updating the cache as `policy` says.
    ///
    /// Root fields the cache policy marks as bypass are always fetched.
    ///
    /// # Errors
    /// Fails with [`LinkError::WrongOperationKind`] for non-query documents and
    /// with the pipeline's classified failure otherwise.
    pub async fn query_with(
        &self,
        operation: Operation,
        policy: FetchPolicy,
    ) -> Result<GraphQLResponse, OperationError> {
        self.expect_kind(&operation, OperationKind::Query)?;
        let key = operation.cache_key();
        let name = operation.display_name().to_owned();

        if policy == FetchPolicy::CacheFirst {
            let bypass = operation
                .root_fields()
                .iter()
                .any(|field| self.cache.policy().bypasses(field));
            if bypass {
                tracing::trace!(operation = %name, "root field bypasses the cache");
            } else if let Some(data) = self.cache.read(&key) {
                tracing::trace!(operation = %name, "answered from cache");
                return Ok(GraphQLResponse::from_data(data));
            }
        }

        let response = self.expect_response(self.execute(operation).await?, &name)?;
        if policy != FetchPolicy::NoCache {
            self.store(&key, &response);
        }
        Ok(response)
    }

    /// Run a mutation and write its payload to the cache
    ///
    /// # Errors
    /// Fails with [`LinkError::WrongOperationKind`] for non-mutation documents
    /// and with the pipeline's classified failure otherwise.
    pub async fn mutate(&self, operation: Operation) -> Result<GraphQLResponse, OperationError> {
        self.expect_kind(&operation, OperationKind::Mutation)?;
        let key = operation.cache_key();
        let name = operation.display_name().to_owned();

        let response = self.expect_response(self.execute(operation).await?, &name)?;
        self.store(&key, &response);
        Ok(response)
    }

    /// Open a subscription; every payload it yields is written to the cache
    ///
    /// # Errors
    /// Fails with [`LinkError::WrongOperationKind`] for non-subscription
    /// documents and when the stream cannot be opened.
    pub async fn subscribe(&self, operation: Operation) -> Result<Subscription, OperationError> {
        self.expect_kind(&operation, OperationKind::Subscription)?;
        let key = operation.cache_key();
        let name = operation.display_name().to_owned();

        let subscription = match self.execute(operation).await? {
            Execution::Subscription(subscription) => subscription,
            Execution::Response(_) => {
                return Err(self.fail(
                    LinkError::WrongOperationKind {
                        expected: OperationKind::Subscription,
                        actual: OperationKind::Query,
                    },
                    &name,
                ));
            }
        };

        let cache = Arc::clone(&self.cache);
        Ok(subscription.with_observer(move |response| {
            if let Some(data) = &response.data {
                cache.write(&key, data);
            }
        }))
    }

    /// New receiver for classified failures and slow-operation reports
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.reporter.events().subscribe()
    }

    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        self.reporter.events()
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<NormalizedCache> {
        &self.cache
    }

    #[must_use]
    pub fn connectivity(&self) -> &Connectivity {
        self.reporter.classifier().connectivity()
    }

    /// Cancel every in-flight operation and subscription. Later calls fail as
    /// cancelled. Calling it again is a no-op.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("gateway client shutting down");
        }
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn store(&self, key: &str, response: &GraphQLResponse) {
        if let Some(data) = response.data.as_ref().filter(|data| !data.is_null()) {
            self.cache.write(key, data);
        }
    }

    /// Classify a failure detected on this side of the pipeline and publish
    /// it like any pipeline failure.
    fn fail(&self, error: LinkError, operation: &str) -> OperationError {
        let classification = self.reporter.report(operation, &error);
        OperationError::new(error, classification, operation)
    }

    fn rejected(&self, error: LinkError, operation: &str) -> LinkError {
        self.reporter.report(operation, &error);
        error
    }

    fn expect_kind(&self, operation: &Operation, expected: OperationKind) -> Result<(), OperationError> {
        let actual = operation.kind();
        if actual == expected {
            return Ok(());
        }
        Err(self.fail(
            LinkError::WrongOperationKind { expected, actual },
            operation.display_name(),
        ))
    }

    fn expect_response(
        &self,
        execution: Execution,
        operation: &str,
    ) -> Result<GraphQLResponse, OperationError> {
        match execution {
            Execution::Response(response) => Ok(response),
            Execution::Subscription(_) => Err(self.fail(
                LinkError::WrongOperationKind {
                    expected: OperationKind::Query,
                    actual: OperationKind::Subscription,
                },
                operation,
            )),
        }
    }

    /// Sessions of operations built outside [`GatewayClient::operation`] are
    /// not children of the shutdown token, so they are linked here.
    fn link_to_shutdown(&self, subscription: &Subscription) {
        let session = subscription.cancellation().clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => session.cancel(),
                () = session.cancelled() => {}
            }
        });
    }

    fn map_buffer_error(err: BoxError, operation: &str) -> OperationError {
        match err.downcast::<OperationError>() {
            Ok(err) => *err,
            Err(_) => {
                tracing::error!(operation, "pipeline worker closed unexpectedly; service unavailable");
                OperationError::new(
                    LinkError::ServiceClosed,
                    ErrorClassification::UnknownNetwork,
                    operation,
                )
            }
        }
    }
}
