//! Shared hyper client stack used by both transports.

use crate::config::{LinkConfig, TransportSecurity};
use crate::error::{InvalidUriKind, LinkError};
use crate::tls;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::time::{Duration, SystemTime};
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneSyncService;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

/// Maximum body preview kept in [`LinkError::HttpStatus`] (8KB).
pub const ERROR_BODY_PREVIEW_LIMIT: usize = 8 * 1024;

/// Type-erased response body (raw or decompressed).
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Type-erased HTTP exchange service shared by the transports.
pub type HttpService = BoxCloneSyncService<Request<Full<Bytes>>, Response<ResponseBody>, LinkError>;

/// Build the hyper client stack.
///
/// Layers (outer to inner): error mapping → per-exchange timeout →
/// decompression → pooled hyper client with rustls. The timeout covers the
/// exchange up to the response head; body reads are bounded by the callers.
///
/// # Errors
/// Returns [`LinkError::Tls`] if the TLS roots cannot be loaded.
pub fn build_http_service(config: &LinkConfig) -> Result<HttpService, LinkError> {
    if config.transport == TransportSecurity::AllowInsecureHttp {
        tracing::debug!("plain HTTP allowed for gateway endpoints");
    }

    let timeout = config.request_timeout;
    let https = tls::https_connector(config.tls_roots, config.transport)?;

    let mut client_builder = Client::builder(TokioExecutor::new());
    // pool_timer is required for pool_idle_timeout to take effect
    client_builder
        .pool_timer(TokioTimer::new())
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .http2_only(false);
    if let Some(idle_timeout) = config.pool_idle_timeout {
        client_builder.pool_idle_timeout(idle_timeout);
    }
    let hyper_client = client_builder.build::<_, Full<Bytes>>(https);

    let service = ServiceBuilder::new()
        .layer(TimeoutLayer::new(timeout))
        .layer(DecompressionLayer::new())
        .service(hyper_client)
        .map_response(box_response_body)
        .map_err(move |e: tower::BoxError| map_tower_error(e, timeout));

    Ok(BoxCloneSyncService::new(service))
}

/// Map tower errors to `LinkError` with the configured timeout
fn map_tower_error(err: tower::BoxError, timeout: Duration) -> LinkError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return LinkError::Timeout(timeout);
    }
    match err.downcast::<LinkError>() {
        Ok(link_err) => *link_err,
        Err(other) => LinkError::Transport(other),
    }
}

fn box_response_body<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.map_err(Into::into).boxed())
}

/// Parse an endpoint and check its scheme against the security mode.
///
/// # Errors
/// Returns [`LinkError::InvalidUri`] or [`LinkError::InvalidScheme`].
pub fn validate_endpoint(url: &str, transport: TransportSecurity) -> Result<Uri, LinkError> {
    let uri: Uri = url
        .parse()
        .map_err(|e: http::uri::InvalidUri| LinkError::InvalidUri {
            url: url.to_owned(),
            kind: InvalidUriKind::ParseError,
            reason: e.to_string(),
        })?;

    if uri.authority().is_none() {
        return Err(LinkError::InvalidUri {
            url: url.to_owned(),
            kind: InvalidUriKind::MissingAuthority,
            reason: "missing host/authority".to_owned(),
        });
    }

    match uri.scheme_str() {
        Some("https") => Ok(uri),
        Some("http") => match transport {
            TransportSecurity::AllowInsecureHttp => Ok(uri),
            TransportSecurity::TlsOnly => Err(LinkError::InvalidScheme {
                scheme: "http".to_owned(),
                reason: "HTTPS required (transport security is tls_only)".to_owned(),
            }),
        },
        Some(scheme) => Err(LinkError::InvalidScheme {
            scheme: scheme.to_owned(),
            reason: "only http:// and https:// schemes are supported".to_owned(),
        }),
        None => Err(LinkError::InvalidUri {
            url: url.to_owned(),
            kind: InvalidUriKind::MissingScheme,
            reason: "missing scheme".to_owned(),
        }),
    }
}

/// Static headers sent with every request: configured headers plus User-Agent.
///
/// # Errors
/// Returns [`LinkError::InvalidHeaderName`] or [`LinkError::InvalidHeaderValue`].
pub fn default_headers(config: &LinkConfig) -> Result<HeaderMap, LinkError> {
    let mut headers = HeaderMap::with_capacity(config.headers.len() + 1);
    for (name, value) in &config.headers {
        headers.insert(
            HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
    }
    if !headers.contains_key(http::header::USER_AGENT) {
        headers.insert(
            http::header::USER_AGENT,
            HeaderValue::from_str(&config.user_agent)?,
        );
    }
    Ok(headers)
}

/// Build a POST carrying an operation body
pub(crate) fn post(
    endpoint: &Uri,
    headers: &HeaderMap,
    accept: &'static str,
    body: Vec<u8>,
) -> Result<Request<Full<Bytes>>, LinkError> {
    let mut request = Request::post(endpoint.clone()).body(Full::new(Bytes::from(body)))?;
    let request_headers = request.headers_mut();
    for (name, value) in headers {
        request_headers.insert(name.clone(), value.clone());
    }
    request_headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    request_headers.insert(http::header::ACCEPT, HeaderValue::from_static(accept));
    Ok(request)
}

/// Turn a non-2xx response into [`LinkError::HttpStatus`].
///
/// The body preview is read with a small limit. GraphQL errors in the body are
/// kept so the classifier can see their codes.
pub(crate) async fn status_error(response: Response<ResponseBody>, max_body_size: usize) -> LinkError {
    let (parts, body) = response.into_parts();
    let retry_after = parse_retry_after(&parts.headers);

    let preview_limit = max_body_size.min(ERROR_BODY_PREVIEW_LIMIT);
    let (body_preview, errors) = match read_body_limited(body, preview_limit).await {
        Ok(bytes) => (
            String::from_utf8_lossy(&bytes).into_owned(),
            serde_json::from_slice::<crate::response::GraphQLResponse>(&bytes)
                .map(|r| r.errors)
                .unwrap_or_default(),
        ),
        Err(LinkError::BodyTooLarge { .. }) => {
            ("<body too large for preview>".to_owned(), Vec::new())
        }
        Err(e) => return e,
    };

    LinkError::HttpStatus {
        status: parts.status,
        body_preview,
        errors,
        retry_after,
    }
}

/// Read a whole body, failing once more than `limit` bytes arrive.
///
/// The limit applies to decompressed bytes.
///
/// # Errors
/// Returns [`LinkError::BodyTooLarge`] or [`LinkError::Transport`].
pub async fn read_body_limited(body: ResponseBody, limit: usize) -> Result<Bytes, LinkError> {
    let mut collected = Vec::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(LinkError::Transport)?;
        if let Some(chunk) = frame.data_ref() {
            if collected.len() + chunk.len() > limit {
                return Err(LinkError::BodyTooLarge {
                    limit,
                    actual: collected.len() + chunk.len(),
                });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}

/// Parse `Retry-After` as delta-seconds or an HTTP-date.
///
/// Returns `None` when missing, unparsable, negative, or already past.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    let trimmed = value.trim();

    if let Ok(seconds) = trimmed.parse::<i64>() {
        return u64::try_from(seconds).ok().map(Duration::from_secs);
    }

    let at = httpdate::parse_http_date(trimmed).ok()?;
    at.duration_since(SystemTime::now()).ok()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http_body_util::Full;

    fn body_of(data: &'static [u8]) -> ResponseBody {
        Full::new(Bytes::from_static(data))
            .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })
            .boxed()
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("https://gw.example.com/graphql", TransportSecurity::TlsOnly).is_ok());
        assert!(
            validate_endpoint("http://localhost:3000/graphql", TransportSecurity::AllowInsecureHttp)
                .is_ok()
        );
        assert!(matches!(
            validate_endpoint("http://localhost:3000/graphql", TransportSecurity::TlsOnly),
            Err(LinkError::InvalidScheme { scheme, .. }) if scheme == "http"
        ));
        assert!(matches!(
            validate_endpoint("ws://localhost:3000/graphql", TransportSecurity::AllowInsecureHttp),
            Err(LinkError::InvalidScheme { scheme, .. }) if scheme == "ws"
        ));
        assert!(matches!(
            validate_endpoint("/graphql", TransportSecurity::AllowInsecureHttp),
            Err(LinkError::InvalidUri {
                kind: InvalidUriKind::MissingAuthority,
                ..
            })
        ));
        assert!(matches!(
            validate_endpoint("http://bad host/", TransportSecurity::AllowInsecureHttp),
            Err(LinkError::InvalidUri {
                kind: InvalidUriKind::ParseError,
                ..
            })
        ));
    }

    #[test]
    fn test_default_headers() {
        let mut config = LinkConfig::default();
        config
            .headers
            .insert("authorization".to_owned(), "Bearer abc".to_owned());
        let headers = default_headers(&config).unwrap();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer abc");
        assert!(headers.get(http::header::USER_AGENT).unwrap().to_str().unwrap().starts_with("mg-link/"));

        config
            .headers
            .insert("bad header".to_owned(), "x".to_owned());
        assert!(matches!(
            default_headers(&config),
            Err(LinkError::InvalidHeaderName(_))
        ));
    }

    #[test]
    fn test_post_sets_wire_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-team", HeaderValue::from_static("core"));
        headers.insert(http::header::ACCEPT, HeaderValue::from_static("text/plain"));
        let uri: Uri = "http://localhost/graphql".parse().unwrap();
        let request = post(&uri, &headers, "text/event-stream", b"{}".to_vec()).unwrap();

        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(request.headers()["x-team"], "core");
        assert_eq!(request.headers()[http::header::ACCEPT], "text/event-stream");
        assert_eq!(
            request.headers()[http::header::CONTENT_TYPE],
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_read_body_limited() {
        let bytes = read_body_limited(body_of(b"hello"), 5).await.unwrap();
        assert_eq!(bytes.as_ref(), b"hello");

        let err = read_body_limited(body_of(b"hello!"), 5).await.unwrap_err();
        assert!(matches!(err, LinkError::BodyTooLarge { limit: 5, actual: 6 }));
    }

    #[tokio::test]
    async fn test_status_error_keeps_graphql_errors() {
        let mut response = Response::new(body_of(
            br#"{"errors":[{"message":"down","extensions":{"code":"SERVICE_UNAVAILABLE"}}]}"#,
        ));
        *response.status_mut() = http::StatusCode::SERVICE_UNAVAILABLE;
        response
            .headers_mut()
            .insert(http::header::RETRY_AFTER, HeaderValue::from_static("3"));

        match status_error(response, 1024).await {
            LinkError::HttpStatus {
                status,
                errors,
                retry_after,
                ..
            } => {
                assert_eq!(status, http::StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(errors[0].code(), Some("SERVICE_UNAVAILABLE"));
                assert_eq!(retry_after, Some(Duration::from_secs(3)));
            }
            other => panic!("expected HttpStatus, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static(" 120 "));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));

        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static("-5"));
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(
            http::header::RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);

        let future = httpdate::fmt_http_date(SystemTime::now() + Duration::from_secs(60));
        headers.insert(http::header::RETRY_AFTER, future.parse().unwrap());
        let parsed = parse_retry_after(&headers).unwrap();
        assert!(parsed.as_secs() >= 58 && parsed.as_secs() <= 60);
    }
}
