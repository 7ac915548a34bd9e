use crate::classify::{Classifier, Connectivity};
use crate::client::{GatewayClient, PipelineService};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::events::EventBus;
use crate::layers::{InstrumentLayer, ReportLayer, Reporter, RetryLayer, RetryPolicy};
use crate::operation::Operation;
use crate::selector::TransportSelector;
use crate::transport::stack::{build_http_service, default_headers, validate_endpoint};
use crate::transport::{
    BufferedTransport, EventStreamConnector, Execution, HttpEventStreamConnector,
    StreamingTransport,
};
use mg_cache::{CachePolicy, NormalizedCache};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::buffer::Buffer;
use tower::{Service, ServiceBuilder};

/// Builder for [`GatewayClient`]
///
/// Assembles the pipeline once, in this order (outermost first):
/// instrumentation, retry, error reporting, transport selection.
///
/// `build` spawns the pipeline's buffer worker, so it must run inside a
/// tokio runtime.
pub struct GatewayClientBuilder {
    config: LinkConfig,
    cache_policy: CachePolicy,
    connectivity: Connectivity,
    event_capacity: Option<usize>,
    stream_connector: Option<Arc<dyn EventStreamConnector>>,
}

impl std::fmt::Debug for GatewayClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClientBuilder")
            .field("config", &self.config)
            .field("cache_policy", &self.cache_policy)
            .field("connectivity", &self.connectivity)
            .field("event_capacity", &self.event_capacity)
            .field("custom_stream_connector", &self.stream_connector.is_some())
            .finish()
    }
}

impl Default for GatewayClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayClientBuilder {
    /// Builder with the local development endpoints and the metaGOTHIC cache preset
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LinkConfig::default())
    }

    #[must_use]
    pub fn with_config(config: LinkConfig) -> Self {
        Self {
            config,
            cache_policy: CachePolicy::metagothic(),
            connectivity: Connectivity::default(),
            event_capacity: None,
            stream_connector: None,
        }
    }

    #[must_use]
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Share a connectivity flag with the host, e.g. a browser `online` watcher
    #[must_use]
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Override `LinkConfig::event_capacity`
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Open event streams through `connector` instead of HTTP
    #[must_use]
    pub fn stream_connector(mut self, connector: Arc<dyn EventStreamConnector>) -> Self {
        self.stream_connector = Some(connector);
        self
    }

    /// Build the client with the HTTP transports.
    ///
    /// # Errors
    /// Returns an error if the cache policy is invalid, an endpoint is not an
    /// acceptable URL, a configured header is malformed, or TLS setup fails.
    pub fn build(mut self) -> Result<GatewayClient, LinkError> {
        self.cache_policy.validate()?;

        let reporter = self.reporter();
        let config = &self.config;
        let http_endpoint = validate_endpoint(&config.http_endpoint, config.transport)?;
        let headers = Arc::new(default_headers(config)?);
        let http = build_http_service(config)?;

        let connector = match self.stream_connector.take() {
            Some(connector) => connector,
            None => {
                let stream_endpoint = validate_endpoint(&config.stream_endpoint, config.transport)?;
                Arc::new(HttpEventStreamConnector::new(
                    http.clone(),
                    stream_endpoint,
                    Arc::clone(&headers),
                    config.max_body_size,
                ))
            }
        };

        let buffered = BufferedTransport::new(
            http,
            http_endpoint,
            headers,
            config.max_body_size,
            config.request_timeout,
        );
        let streaming = StreamingTransport::new(connector, config.stream.clone(), reporter.clone());

        tracing::debug!(
            http_endpoint = %config.http_endpoint,
            stream_endpoint = %config.stream_endpoint,
            "building gateway client"
        );
        Ok(self.assemble(TransportSelector::new(buffered, streaming), reporter))
    }

    /// Build the client around a caller-supplied transport.
    ///
    /// The transport receives every operation after retry and reporting, so a
    /// test double sees each attempt separately.
    ///
    /// # Errors
    /// Returns an error if the cache policy is invalid.
    pub fn build_with_transport<T>(self, transport: T) -> Result<GatewayClient, LinkError>
    where
        T: Service<Operation, Response = Execution, Error = LinkError> + Clone + Send + 'static,
        T::Future: Send + 'static,
    {
        self.cache_policy.validate()?;
        let reporter = self.reporter();
        Ok(self.assemble(transport, reporter))
    }

    fn reporter(&self) -> Reporter {
        let capacity = self.event_capacity.unwrap_or(self.config.event_capacity);
        Reporter::new(
            Classifier::new(self.connectivity.clone()),
            EventBus::new(capacity),
        )
    }

    fn assemble<T>(self, transport: T, reporter: Reporter) -> GatewayClient
    where
        T: Service<Operation, Response = Execution, Error = LinkError> + Clone + Send + 'static,
        T::Future: Send + 'static,
    {
        let pipeline = ServiceBuilder::new()
            .layer(InstrumentLayer::new(
                self.config.slow_operation_threshold,
                reporter.events().clone(),
            ))
            .layer(RetryLayer::new(
                RetryPolicy::new(self.config.retry.clone()),
                reporter.classifier().clone(),
            ))
            .layer(ReportLayer::new(reporter.clone()))
            .service(transport);

        let service: PipelineService = Buffer::new(pipeline, self.config.buffer_capacity.max(1));

        GatewayClient {
            service,
            cache: Arc::new(NormalizedCache::new(self.cache_policy)),
            reporter,
            shutdown: CancellationToken::new(),
        }
    }
}
