#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! GraphQL link pipeline for the metaGOTHIC gateway
//!
//! Every operation travels through one pipeline:
//! - **Instrumentation**: end-to-end timing and slow-operation reports
//! - **Retry**: bounded exponential backoff for transient failures
//! - **Error reporting**: one classification per failed attempt, broadcast as
//!   [`LinkEvent`]
//! - **Transport selection**: queries and mutations go over buffered HTTP,
//!   subscriptions over a server-sent event stream
//!
//! Results land in a normalized cache ([`mg_cache`]) so dashboard views that
//! show the same repository or workflow run agree with each other.
//!
//! The client is built explicitly and passed around; there is no global
//! instance. Clones are cheap and share everything.
//!
//! # Example
//!
//! ```ignore
//! use mg_link::{GatewayClient, LinkConfig};
//!
//! let client = GatewayClient::builder()
//!     .with_config(LinkConfig::for_gateway("http://localhost:3000/graphql"))
//!     .build()?;
//!
//! let op = client
//!     .operation("mutation Commit($path: String!) { commitChanges(path: $path) { hash } }")?
//!     .variable("path", "/repos/meta");
//! let response = client.mutate(op).await?;
//!
//! let mut runs = client
//!     .subscribe(client.operation("subscription { workflowRun { id status logs } }")?)
//!     .await?;
//! while let Some(update) = runs.recv().await {
//!     println!("{:?}", update?.data);
//! }
//! ```

pub mod batch;
mod builder;
pub mod classify;
mod client;
pub mod config;
pub mod document;
mod error;
pub mod events;
pub mod layers;
mod operation;
mod response;
pub mod selector;
mod tls;
pub mod transport;

pub use batch::{BatchArgument, BatchBuilder, BatchField, BatchResult, ComposedOperation};
pub use builder::GatewayClientBuilder;
pub use classify::{Classifier, Connectivity, ErrorClassification};
pub use client::{FetchPolicy, GatewayClient, PipelineFuture, PipelineService};
pub use config::{
    DEFAULT_HTTP_ENDPOINT, DEFAULT_STREAM_ENDPOINT, DEFAULT_USER_AGENT, ExponentialBackoff,
    LinkConfig, ReconnectConfig, RetryConfig, StreamConfig, TlsRootConfig, TransportSecurity,
    duration_serde,
};
pub use document::{DocumentError, OperationKind};
pub use error::{InvalidUriKind, LinkError, OperationError};
pub use events::{EventBus, LinkEvent};
pub use operation::Operation;
pub use response::{ErrorLocation, GraphQLError, GraphQLResponse, ResponseMeta};
pub use transport::{Execution, Subscription, SubscriptionItem};
