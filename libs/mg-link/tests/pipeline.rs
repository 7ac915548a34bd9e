//! End-to-end tests: `GatewayClient` against a mock gateway

use httpmock::prelude::*;
use mg_link::{
    ErrorClassification, Execution, FetchPolicy, GatewayClient, GatewayClientBuilder, GraphQLResponse,
    LinkConfig, LinkError, LinkEvent, Operation,
};
use serde_json::json;
use std::io::Write;
use std::time::Duration;

fn config_for(server: &MockServer) -> LinkConfig {
    LinkConfig {
        http_endpoint: server.url("/graphql"),
        stream_endpoint: server.url("/graphql/stream"),
        ..LinkConfig::for_testing()
    }
}

fn client_for(server: &MockServer) -> GatewayClient {
    GatewayClientBuilder::with_config(config_for(server))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_query_round_trip() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/graphql").json_body(json!({
            "query": "query Repo($path: String!) { repository(path: $path) { path branch } }",
            "variables": {"path": "/repos/meta"},
            "operationName": "Repo"
        }));
        then.status(200).json_body(json!({
            "data": {"repository": {"__typename": "Repository", "path": "/repos/meta", "branch": "main"}}
        }));
    });

    let client = client_for(&server);
    let op = client
        .operation("query Repo($path: String!) { repository(path: $path) { path branch } }")
        .unwrap()
        .variable("path", "/repos/meta");
    let response = client.query(op).await.unwrap();

    mock.assert();
    assert_eq!(response.data.unwrap()["repository"]["branch"], "main");
    assert_eq!(response.meta.attempts, 1);
    assert!(response.meta.duration.is_some());
    assert!(
        client
            .cache()
            .entity(r#"Repository:{"path":"/repos/meta"}"#)
            .is_some()
    );
}

#[tokio::test]
async fn test_partial_errors_are_success() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/graphql");
        then.status(200).json_body(json!({
            "data": {"a": 1, "b": null},
            "errors": [{"message": "b failed", "path": ["b"]}]
        }));
    });

    let client = client_for(&server);
    let response = client
        .query(client.operation("query Two { a b }").unwrap())
        .await
        .unwrap();
    assert_eq!(response.data.unwrap()["a"], 1);
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].root_path(), Some("b"));
}

#[tokio::test]
async fn test_unavailable_gateway_is_retried_until_exhausted() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/graphql");
        then.status(503).body("upstream down");
    });

    let client = client_for(&server);
    let mut events = client.events();
    let err = client
        .query_with(
            client.operation("query Scan { repositories { path } }").unwrap(),
            FetchPolicy::NetworkOnly,
        )
        .await
        .unwrap_err();

    assert_eq!(mock.calls(), 5);
    assert_eq!(err.classification, ErrorClassification::ServiceUnavailable);
    assert_eq!(err.meta.attempts, 5);
    assert!(matches!(err.error, LinkError::HttpStatus { .. }));

    // One report per attempt
    for _ in 0..5 {
        assert!(matches!(
            events.try_recv().unwrap(),
            LinkEvent::ServiceUnavailable { .. }
        ));
    }
}

#[tokio::test]
async fn test_unauthenticated_is_not_retried() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/graphql");
        then.status(401).json_body(json!({
            "errors": [{"message": "token expired", "extensions": {"code": "UNAUTHENTICATED"}}]
        }));
    });

    let client = client_for(&server);
    let mut events = client.events();
    let err = client
        .mutate(client.operation("mutation Commit { commit { hash } }").unwrap())
        .await
        .unwrap_err();

    assert_eq!(mock.calls(), 1);
    assert_eq!(err.classification, ErrorClassification::Unauthenticated);
    assert_eq!(err.operation, "Commit");
    assert!(matches!(
        events.try_recv().unwrap(),
        LinkEvent::Unauthenticated { ref operation, .. } if operation == "Commit"
    ));
}

#[tokio::test]
async fn test_validation_failure_reports_suggestions() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/graphql");
        then.status(200).json_body(json!({
            "errors": [{
                "message": "Cannot query field \"repo\" on type \"Query\". Did you mean \"repos\" or \"repository\"?",
                "extensions": {"code": "GRAPHQL_VALIDATION_FAILED"}
            }]
        }));
    });

    let client = client_for(&server);
    let mut events = client.events();
    let err = client
        .query(client.operation("query Bad { repo }").unwrap())
        .await
        .unwrap_err();

    assert_eq!(err.classification, ErrorClassification::ValidationFailure);
    match events.try_recv().unwrap() {
        LinkEvent::ValidationFailed { suggestions, .. } => {
            assert_eq!(suggestions, vec!["repos".to_owned(), "repository".to_owned()]);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_cache_first_avoids_second_request() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/graphql");
        then.status(200).json_body(json!({
            "data": {"repositories": [
                {"__typename": "Repository", "path": "/a", "branch": "main"},
                {"__typename": "Repository", "path": "/b", "branch": "dev"}
            ]}
        }));
    });

    let client = client_for(&server);
    let query = "query Repos { repositories { path branch } }";
    let first = client.query(client.operation(query).unwrap()).await.unwrap();
    let second = client.query(client.operation(query).unwrap()).await.unwrap();

    assert_eq!(mock.calls(), 1);
    assert_eq!(first.data, second.data);
}

#[tokio::test]
async fn test_bypass_root_field_refetches() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/graphql");
        then.status(200).json_body(json!({
            "data": {"systemHealth": {"__typename": "ServiceHealth", "status": "ok"}}
        }));
    });

    let client = client_for(&server);
    let query = "query Health { systemHealth { status } }";
    client.query(client.operation(query).unwrap()).await.unwrap();
    client.query(client.operation(query).unwrap()).await.unwrap();

    assert_eq!(mock.calls(), 2);
}

#[tokio::test]
async fn test_gzip_response_is_decompressed() {
    let server = MockServer::start();
    let body = serde_json::to_vec(&json!({"data": {"ok": true}})).unwrap();
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&body).unwrap();
    let compressed = encoder.finish().unwrap();

    server.mock(|when, then| {
        when.method(POST)
            .path("/graphql")
            .header_exists("accept-encoding");
        then.status(200)
            .header("content-type", "application/json")
            .header("content-encoding", "gzip")
            .body(compressed);
    });

    let client = client_for(&server);
    let response = client
        .query(client.operation("query Ok { ok }").unwrap())
        .await
        .unwrap();
    assert_eq!(response.data, Some(json!({"ok": true})));
}

#[tokio::test]
async fn test_subscription_over_event_stream() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/graphql/stream")
            .header("accept", "text/event-stream");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(concat!(
                ": connected\n\n",
                "id: 1\n",
                "data: {\"data\":{\"run\":{\"__typename\":\"WorkflowRun\",\"id\":\"r1\",\"logs\":[\"clone\"]}}}\n\n",
                "id: 2\n",
                "data: {\"data\":{\"run\":{\"__typename\":\"WorkflowRun\",\"id\":\"r1\",\"logs\":[\"build\"]}}}\n\n",
                "event: complete\n",
                "data:\n\n",
            ));
    });

    let client = client_for(&server);
    let op = client
        .operation("subscription Run { run { id logs } }")
        .unwrap();
    let mut subscription = client.subscribe(op).await.unwrap();

    let first = subscription.recv().await.unwrap().unwrap();
    let second = subscription.recv().await.unwrap().unwrap();
    assert!(subscription.recv().await.is_none());

    mock.assert();
    assert_eq!(first.data.unwrap()["run"]["logs"], json!(["clone"]));
    assert_eq!(second.data.unwrap()["run"]["logs"], json!(["build"]));

    // Both payloads were merged into the one run record
    let run = client.cache().entity(r#"WorkflowRun:{"id":"r1"}"#).unwrap();
    assert_eq!(run["logs"], json!(["clone", "build"]));
}

#[tokio::test]
async fn test_subscription_rejected_up_front() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/graphql/stream");
        then.status(200).json_body(json!({
            "errors": [{"message": "Unknown type \"Rn\"", "extensions": {"code": "GRAPHQL_VALIDATION_FAILED"}}]
        }));
    });

    let client = client_for(&server);
    let err = client
        .subscribe(client.operation("subscription Run { run { id } }").unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.classification, ErrorClassification::ValidationFailure);
}

#[tokio::test]
async fn test_slow_operation_is_reported() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/graphql");
        then.status(200)
            .delay(Duration::from_millis(150))
            .json_body(json!({"data": {"ok": true}}));
    });

    let config = LinkConfig {
        slow_operation_threshold: Duration::from_millis(50),
        ..config_for(&server)
    };
    let client = GatewayClientBuilder::with_config(config).build().unwrap();
    let mut events = client.events();

    let response = client
        .query(client.operation("query Ok { ok }").unwrap())
        .await
        .unwrap();
    assert!(response.meta.slow);
    assert!(matches!(
        events.try_recv().unwrap(),
        LinkEvent::SlowOperation { ref operation, .. } if operation == "Ok"
    ));
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_request() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/graphql");
        then.status(200)
            .delay(Duration::from_secs(3))
            .json_body(json!({"data": {"ok": true}}));
    });

    let client = client_for(&server);
    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .query(client.operation("query Ok { ok }").unwrap())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.shutdown();

    let err = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_custom_transport_sees_every_attempt() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let transport = tower::service_fn(move |_op: Operation| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if attempt < 3 {
                Err(LinkError::Transport("connection reset by peer".into()))
            } else {
                Ok(Execution::Response(GraphQLResponse::from_data(json!({"ok": true}))))
            }
        }
    });

    let client = GatewayClientBuilder::with_config(LinkConfig::for_testing())
        .build_with_transport(transport)
        .unwrap();
    let response = client
        .query(client.operation("query Ok { ok }").unwrap())
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(response.meta.attempts, 3);
}

#[tokio::test]
async fn test_resolver_error_text_is_not_a_network_signal() {
    use mg_link::GraphQLError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let transport = tower::service_fn(move |_op: Operation| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            Err::<Execution, _>(LinkError::GraphQL {
                errors: vec![GraphQLError::new("Repository scan timed out on /repos/meta")],
            })
        }
    });

    let client = GatewayClientBuilder::with_config(LinkConfig::for_testing())
        .build_with_transport(transport)
        .unwrap();
    let mut events = client.events();
    let err = client
        .query(client.operation("query Scan { repositories { path } }").unwrap())
        .await
        .unwrap_err();

    assert_eq!(err.classification, ErrorClassification::UnknownGraphql);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        events.try_recv().unwrap(),
        LinkEvent::UnknownError {
            classification: ErrorClassification::UnknownGraphql,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_duration_spans_every_attempt_and_backoff() {
    use mg_link::{ExponentialBackoff, RetryConfig};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ATTEMPT: Duration = Duration::from_millis(50);
    const BACKOFF: Duration = Duration::from_millis(250);

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let transport = tower::service_fn(move |_op: Operation| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            tokio::time::sleep(ATTEMPT).await;
            if attempt == 1 {
                Err(LinkError::Transport("connection reset by peer".into()))
            } else {
                Ok(Execution::Response(GraphQLResponse::from_data(json!({"ok": true}))))
            }
        }
    });

    let config = LinkConfig {
        retry: RetryConfig {
            backoff: ExponentialBackoff {
                initial: BACKOFF,
                max: Duration::from_secs(5),
                multiplier: 2.0,
                jitter: false,
            },
            ..RetryConfig::default()
        },
        slow_operation_threshold: Duration::from_secs(10),
        ..LinkConfig::for_testing()
    };
    let client = GatewayClientBuilder::with_config(config)
        .build_with_transport(transport)
        .unwrap();
    let response = client
        .query(client.operation("query Ok { ok }").unwrap())
        .await
        .unwrap();

    assert_eq!(response.meta.attempts, 2);
    assert_eq!(response.meta.duration, Some(ATTEMPT + BACKOFF + ATTEMPT));
    assert!(!response.meta.slow);
}
