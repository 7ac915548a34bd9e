use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default User-Agent string for gateway requests
pub const DEFAULT_USER_AGENT: &str = concat!("mg-link/", env!("CARGO_PKG_VERSION"));

/// Local development gateway endpoint for queries and mutations
pub const DEFAULT_HTTP_ENDPOINT: &str = "http://localhost:3000/graphql";

/// Local development gateway endpoint for subscriptions
pub const DEFAULT_STREAM_ENDPOINT: &str = "http://localhost:3000/graphql/stream";

/// Exponential backoff configuration
///
/// Computes delay as: `min(initial * multiplier^attempt, max)` with optional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExponentialBackoff {
    /// Initial backoff duration (default: 300ms)
    #[serde(with = "duration_serde")]
    pub initial: Duration,

    /// Maximum backoff duration (default: 5s)
    #[serde(with = "duration_serde")]
    pub max: Duration,

    /// Backoff multiplier for exponential growth (default: 2.0)
    pub multiplier: f64,

    /// Enable jitter to prevent thundering herd (default: true)
    ///
    /// When enabled, adds random delay of 0-25% to each backoff.
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(300),
            max: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    /// Create backoff with custom initial and max durations
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    /// Create fast backoff for testing (1ms initial, 100ms max, no jitter)
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Retry policy configuration
///
/// Which failures are retried is decided by their classification, see
/// [`crate::RetryPolicy`]. This only bounds how often and how fast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum number of attempts including the first one (default: 5)
    pub max_attempts: usize,

    /// Stricter attempt cap for timeouts (default: 2)
    pub timeout_max_attempts: usize,

    /// Backoff strategy configuration
    pub backoff: ExponentialBackoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            timeout_max_attempts: 2,
            backoff: ExponentialBackoff::default(),
        }
    }
}

impl RetryConfig {
    /// Create config with no retries
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            timeout_max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Reconnect policy of a streaming session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    /// Consecutive failed reconnects tolerated before the session fails (default: 5)
    pub max_attempts: usize,

    /// A connection that stays up this long resets the failure count (default: 10s)
    #[serde(with = "duration_serde")]
    pub stable_after: Duration,

    /// Delay between reconnects (default: 1s initial, 30s max)
    pub backoff: ExponentialBackoff,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            stable_after: Duration::from_secs(10),
            backoff: ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30)),
        }
    }
}

/// Streaming transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    /// Results buffered between the session task and the subscriber (default: 64)
    pub channel_capacity: usize,

    /// Largest accepted event frame in bytes; larger frames are dropped (default: 1 MiB)
    pub max_frame_bytes: usize,

    /// Reconnect policy on unexpected connection loss
    pub reconnect: ReconnectConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            max_frame_bytes: 1024 * 1024,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Use Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// Use OS native root certificate store
    Native,
}

/// Transport security configuration
///
/// Controls whether the client enforces TLS or allows plain HTTP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransportSecurity {
    /// Require TLS for all connections (HTTPS only)
    TlsOnly,
    /// Allow plain HTTP connections
    ///
    /// The default, because the documented development gateway listens on
    /// `http://localhost:3000`. Deployments against a remote gateway should
    /// switch to `TlsOnly`.
    #[default]
    AllowInsecureHttp,
}

/// Gateway link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// Endpoint for queries and mutations
    pub http_endpoint: String,

    /// Endpoint for subscriptions (server-sent events)
    pub stream_endpoint: String,

    /// Static headers sent with every request, e.g. `authorization`
    pub headers: BTreeMap<String, String>,

    /// User-Agent header value
    pub user_agent: String,

    /// Per-attempt timeout for buffered requests (default: 30s)
    ///
    /// Also bounds how long opening a stream may take. Once a stream is open
    /// it has no deadline.
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Maximum response body size in bytes (default: 10 MB)
    pub max_body_size: usize,

    /// Transport security mode
    pub transport: TransportSecurity,

    /// TLS root certificate strategy (default: `web_pki`)
    pub tls_roots: TlsRootConfig,

    /// Timeout for idle pooled connections (default: 90s)
    #[serde(with = "duration_serde::option")]
    pub pool_idle_timeout: Option<Duration>,

    /// Maximum number of idle connections per host (default: 32)
    pub pool_max_idle_per_host: usize,

    /// Operations that may queue for the pipeline (default: 1024)
    pub buffer_capacity: usize,

    /// Retry policy for queries, mutations and subscription setup
    pub retry: RetryConfig,

    /// Streaming transport settings
    pub stream: StreamConfig,

    /// Operations slower than this are reported (default: 100ms)
    #[serde(with = "duration_serde")]
    pub slow_operation_threshold: Duration,

    /// Capacity of the event broadcast channel (default: 256)
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            http_endpoint: DEFAULT_HTTP_ENDPOINT.to_owned(),
            stream_endpoint: DEFAULT_STREAM_ENDPOINT.to_owned(),
            headers: BTreeMap::new(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            request_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
            transport: TransportSecurity::default(),
            tls_roots: TlsRootConfig::default(),
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
            buffer_capacity: 1024,
            retry: RetryConfig::default(),
            stream: StreamConfig::default(),
            slow_operation_threshold: Duration::from_millis(100),
            event_capacity: 256,
        }
    }
}

impl LinkConfig {
    /// Configuration pointing both endpoints at one gateway base URL
    ///
    /// `base` is the HTTP endpoint; the stream endpoint is `{base}/stream`.
    #[must_use]
    pub fn for_gateway(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            http_endpoint: base.to_owned(),
            stream_endpoint: format!("{base}/stream"),
            ..Default::default()
        }
    }

    /// Create configuration for tests (fast retries, short timeouts)
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            retry: RetryConfig {
                backoff: ExponentialBackoff::fast(),
                ..Default::default()
            },
            stream: StreamConfig {
                reconnect: ReconnectConfig {
                    backoff: ExponentialBackoff::fast(),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Serde support for durations written in humantime form (`300ms`, `5s`, `1m 30s`).
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use std::time::Duration;
///
/// #[derive(Serialize, Deserialize)]
/// struct Foo {
///     #[serde(with = "mg_link::duration_serde")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use std::fmt;
    use std::time::Duration;

    struct DurationVisitor;

    impl de::Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration such as \"300ms\" or \"5s\"")
        }

        fn visit_str<E>(self, v: &str) -> Result<Duration, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v).map_err(|e| E::custom(format!("{e}: {v:?}")))
        }
    }

    /// Deserializes a `Duration` via the humantime crate.
    ///
    /// # Errors
    /// Fails when the input is not a humantime duration string.
    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        d.deserialize_str(DurationVisitor)
    }

    /// Serializes a `Duration` via the humantime crate.
    ///
    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.collect_str(&humantime::format_duration(*d))
    }

    /// Same as the parent module, for `Option<Duration>`.
    pub mod option {
        use super::{Deserialize, Deserializer, Duration, Serializer};

        #[derive(serde::Deserialize)]
        struct Wrapper(#[serde(with = "super")] Duration);

        /// # Errors
        /// Fails when the input is neither null nor a humantime duration string.
        pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<Wrapper>::deserialize(d).map(|w| w.map(|Wrapper(d)| d))
        }

        /// # Errors
        /// Propagates serializer errors.
        #[allow(clippy::ref_option)]
        pub fn serialize<S>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match d {
                Some(d) => super::serialize(d, s),
                None => s.serialize_none(),
            }
        }
    }
}
