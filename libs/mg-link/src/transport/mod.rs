//! Transports: buffered request/response and streaming subscriptions.

pub mod buffered;
pub mod stack;
pub mod sse;
pub mod streaming;

pub use buffered::BufferedTransport;
pub use stack::{HttpService, ResponseBody};
pub use sse::{DecoderState, FrameDecoder, FrameKind, SseFrame};
pub use streaming::{
    EventStreamConnector, HttpEventStreamConnector, StreamingTransport, Subscription,
    SubscriptionItem,
};

use crate::response::{GraphQLResponse, ResponseMeta};

/// What a pipeline call produces: one response or a live subscription
#[derive(Debug)]
pub enum Execution {
    Response(GraphQLResponse),
    Subscription(Subscription),
}

impl Execution {
    #[must_use]
    pub fn meta(&self) -> &ResponseMeta {
        match self {
            Self::Response(response) => &response.meta,
            Self::Subscription(subscription) => subscription.meta(),
        }
    }

    pub fn meta_mut(&mut self) -> &mut ResponseMeta {
        match self {
            Self::Response(response) => &mut response.meta,
            Self::Subscription(subscription) => subscription.meta_mut(),
        }
    }

    /// The response, or `None` for a subscription (which is then cancelled)
    #[must_use]
    pub fn into_response(self) -> Option<GraphQLResponse> {
        match self {
            Self::Response(response) => Some(response),
            Self::Subscription(_) => None,
        }
    }

    /// The subscription, or `None` for a plain response
    #[must_use]
    pub fn into_subscription(self) -> Option<Subscription> {
        match self {
            Self::Subscription(subscription) => Some(subscription),
            Self::Response(_) => None,
        }
    }
}

impl From<GraphQLResponse> for Execution {
    fn from(response: GraphQLResponse) -> Self {
        Self::Response(response)
    }
}

impl From<Subscription> for Execution {
    fn from(subscription: Subscription) -> Self {
        Self::Subscription(subscription)
    }
}
