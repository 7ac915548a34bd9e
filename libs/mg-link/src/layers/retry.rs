use crate::classify::{Classifier, ErrorClassification};
use crate::config::{ExponentialBackoff, RetryConfig};
use crate::error::{LinkError, OperationError};
use crate::operation::Operation;
use crate::transport::Execution;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service, ServiceExt};

/// Outcome of [`RetryPolicy::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Dispatch again after the delay
    Retry(Duration),
    /// Return the last failure
    Stop,
}

/// Whether a failure of this class may succeed on another attempt
#[must_use]
pub fn is_retryable(classification: ErrorClassification) -> bool {
    match classification {
        ErrorClassification::ServiceUnavailable
        | ErrorClassification::ConnectionRefused
        | ErrorClassification::Offline
        | ErrorClassification::UnknownNetwork
        | ErrorClassification::Timeout => true,
        ErrorClassification::ValidationFailure
        | ErrorClassification::Unauthenticated
        | ErrorClassification::UnknownGraphql
        | ErrorClassification::Cancelled => false,
    }
}

/// Retry eligibility and delay, independent of any service
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide what follows the failure of attempt number `attempt` (1-based).
    ///
    /// Timeouts get their own, lower attempt budget. A server-provided
    /// `retry_after` replaces the computed backoff but never exceeds the
    /// backoff maximum.
    #[must_use]
    pub fn decide(
        &self,
        attempt: usize,
        classification: ErrorClassification,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if !is_retryable(classification) {
            return RetryDecision::Stop;
        }

        let limit = if classification == ErrorClassification::Timeout {
            self.config.timeout_max_attempts.min(self.config.max_attempts)
        } else {
            self.config.max_attempts
        };
        if attempt >= limit {
            return RetryDecision::Stop;
        }

        let delay = retry_after.map_or_else(
            || calculate_backoff(&self.config.backoff, attempt.saturating_sub(1)),
            |after| after.min(self.config.backoff.max),
        );
        RetryDecision::Retry(delay)
    }
}

/// Tower layer re-dispatching failed operations according to a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryLayer {
    policy: RetryPolicy,
    classifier: Classifier,
}

impl RetryLayer {
    #[must_use]
    pub fn new(policy: RetryPolicy, classifier: Classifier) -> Self {
        Self { policy, classifier }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: self.policy.clone(),
            classifier: self.classifier.clone(),
        }
    }
}

/// Runs attempts one after another until one succeeds or the policy stops.
///
/// The terminal failure is returned unchanged inside an [`OperationError`]
/// with its classification and the number of attempts made.
#[derive(Debug, Clone)]
pub struct RetryService<S> {
    inner: S,
    policy: RetryPolicy,
    classifier: Classifier,
}

impl<S> Service<Operation> for RetryService<S>
where
    S: Service<Operation, Response = Execution, Error = LinkError> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Execution;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<Execution, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(|err| {
            let classification = self.classifier.classify(&err);
            OperationError::new(err, classification, crate::operation::ANONYMOUS_OPERATION)
        })
    }

    fn call(&mut self, operation: Operation) -> Self::Future {
        // Swap so we consume the instance that was poll_ready'd,
        // leaving a fresh clone for the next poll_ready cycle.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let policy = self.policy.clone();
        let classifier = self.classifier.clone();

        Box::pin(async move {
            let name = operation.display_name().to_owned();
            let failed = |error: LinkError, classification, attempts| {
                let mut err = OperationError::new(error, classification, name.clone());
                err.meta.attempts = attempts;
                err
            };

            let mut attempt = 0usize;
            loop {
                attempt += 1;
                let mut svc = inner.clone();
                let result = match svc.ready().await {
                    Ok(ready) => ready.call(operation.clone()).await,
                    Err(err) => Err(err),
                };

                let err = match result {
                    Ok(mut execution) => {
                        execution.meta_mut().attempts = attempt;
                        return Ok(execution);
                    }
                    Err(err) => err,
                };

                let classification = classifier.classify(&err);
                let delay = match policy.decide(attempt, classification, err.retry_after()) {
                    RetryDecision::Retry(delay) => delay,
                    RetryDecision::Stop => return Err(failed(err, classification, attempt)),
                };

                tracing::debug!(
                    operation = %name,
                    retry = attempt,
                    max_attempts = policy.config().max_attempts,
                    classification = %classification,
                    error = %err,
                    backoff_ms = delay.as_millis(),
                    "Retrying operation"
                );

                tokio::select! {
                    biased;
                    () = operation.cancellation().cancelled() => {
                        return Err(failed(LinkError::Cancelled, ErrorClassification::Cancelled, attempt));
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
        })
    }
}

/// Calculate backoff duration for a given retry index (0 for the first retry)
///
/// Safely handles edge cases (NaN, infinity, negative values) to avoid panics.
#[must_use]
pub fn calculate_backoff(backoff: &ExponentialBackoff, attempt: usize) -> Duration {
    // Maximum safe backoff in seconds (1 day - beyond this is unreasonable for retry logic)
    const MAX_BACKOFF_SECS: f64 = 86400.0;

    let attempt_i32 = i32::try_from(attempt).unwrap_or(i32::MAX);

    // Sanitize multiplier: must be finite and >= 0, default to 1.0
    let multiplier = if backoff.multiplier.is_finite() && backoff.multiplier >= 0.0 {
        backoff.multiplier
    } else {
        1.0
    };

    let initial_secs = backoff.initial.as_secs_f64();
    let max_secs = backoff.max.as_secs_f64().min(MAX_BACKOFF_SECS);

    let base = initial_secs * multiplier.powi(attempt_i32);
    let clamped = if base.is_finite() {
        base.min(max_secs).max(0.0)
    } else {
        max_secs
    };
    let duration = Duration::from_secs_f64(clamped);

    let duration = if backoff.jitter {
        let jitter_factor = rand::rng().random_range(0.0..=0.25);
        duration + duration.mul_f64(jitter_factor)
    } else {
        duration
    };

    // Keep jittered value within max
    duration.min(Duration::from_secs_f64(max_secs))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::response::GraphQLResponse;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            backoff: ExponentialBackoff {
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn status(code: u16, retry_after: Option<Duration>) -> LinkError {
        LinkError::HttpStatus {
            status: http::StatusCode::from_u16(code).unwrap(),
            body_preview: String::new(),
            errors: Vec::new(),
            retry_after,
        }
    }

    /// Inner service that fails with `make_error` for the first `failures`
    /// calls and records when every call started
    #[derive(Clone)]
    struct Flaky {
        failures: usize,
        calls: Arc<AtomicUsize>,
        started: Arc<parking_lot::Mutex<Vec<Instant>>>,
        make_error: fn() -> LinkError,
    }

    impl Flaky {
        fn new(failures: usize, make_error: fn() -> LinkError) -> Self {
            Self {
                failures,
                calls: Arc::new(AtomicUsize::new(0)),
                started: Arc::new(parking_lot::Mutex::new(Vec::new())),
                make_error,
            }
        }

        fn gaps_ms(&self) -> Vec<u128> {
            let started = self.started.lock();
            started
                .windows(2)
                .map(|w| (w[1] - w[0]).as_millis())
                .collect()
        }
    }

    impl Service<Operation> for Flaky {
        type Response = Execution;
        type Error = LinkError;
        type Future = Pin<Box<dyn Future<Output = Result<Execution, LinkError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), LinkError>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _op: Operation) -> Self::Future {
            self.started.lock().push(Instant::now());
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if n < self.failures {
                Err((self.make_error)())
            } else {
                Ok(Execution::Response(GraphQLResponse::from_data(
                    serde_json::json!({"ok": true}),
                )))
            };
            Box::pin(async move { result })
        }
    }

    fn service(inner: Flaky, config: RetryConfig) -> RetryService<Flaky> {
        RetryLayer::new(RetryPolicy::new(config), Classifier::default()).layer(inner)
    }

    fn op() -> Operation {
        Operation::new("query Health { systemHealth { ok } }").unwrap()
    }

    #[test]
    fn test_decide_stops_on_terminal_classes() {
        let policy = RetryPolicy::default();
        for class in [
            ErrorClassification::ValidationFailure,
            ErrorClassification::Unauthenticated,
            ErrorClassification::UnknownGraphql,
            ErrorClassification::Cancelled,
        ] {
            assert_eq!(policy.decide(1, class, None), RetryDecision::Stop, "{class}");
        }
    }

    #[test]
    fn test_decide_respects_attempt_budgets() {
        let policy = RetryPolicy::new(no_jitter());
        let unavailable = ErrorClassification::ServiceUnavailable;
        assert_eq!(
            policy.decide(1, unavailable, None),
            RetryDecision::Retry(Duration::from_millis(300))
        );
        assert_eq!(
            policy.decide(4, unavailable, None),
            RetryDecision::Retry(Duration::from_millis(2400))
        );
        assert_eq!(policy.decide(5, unavailable, None), RetryDecision::Stop);

        let timeout = ErrorClassification::Timeout;
        assert!(matches!(policy.decide(1, timeout, None), RetryDecision::Retry(_)));
        assert_eq!(policy.decide(2, timeout, None), RetryDecision::Stop);
    }

    #[test]
    fn test_decide_prefers_retry_after_capped_at_max() {
        let policy = RetryPolicy::new(no_jitter());
        let class = ErrorClassification::ServiceUnavailable;
        assert_eq!(
            policy.decide(1, class, Some(Duration::from_secs(2))),
            RetryDecision::Retry(Duration::from_secs(2))
        );
        assert_eq!(
            policy.decide(1, class, Some(Duration::from_secs(600))),
            RetryDecision::Retry(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_disabled_config_never_retries() {
        let policy = RetryPolicy::new(RetryConfig::disabled());
        assert_eq!(
            policy.decide(1, ErrorClassification::ConnectionRefused, None),
            RetryDecision::Stop
        );
    }

    #[test]
    fn test_backoff_sanitizes_inputs() {
        let mut backoff = ExponentialBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: f64::NAN,
            jitter: false,
        };
        assert_eq!(calculate_backoff(&backoff, 3), Duration::from_millis(100));

        backoff.multiplier = f64::INFINITY;
        assert_eq!(calculate_backoff(&backoff, 3), Duration::from_millis(100));

        backoff.multiplier = 10.0;
        assert_eq!(calculate_backoff(&backoff, 1000), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_stays_within_bounds() {
        let backoff = ExponentialBackoff::default();
        for attempt in 0..8 {
            let base = calculate_backoff(
                &ExponentialBackoff {
                    jitter: false,
                    ..backoff.clone()
                },
                attempt,
            );
            let jittered = calculate_backoff(&backoff, attempt);
            assert!(jittered >= base);
            assert!(jittered <= base.mul_f64(1.25).min(backoff.max));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_unavailable_retried_with_exponential_delays() {
        let inner = Flaky::new(usize::MAX, || status(503, None));
        let err = service(inner.clone(), no_jitter()).oneshot(op()).await.unwrap_err();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 5);
        assert_eq!(inner.gaps_ms(), [300, 600, 1200, 2400]);
        assert_eq!(err.classification, ErrorClassification::ServiceUnavailable);
        assert_eq!(err.meta.attempts, 5);
        assert_eq!(err.operation, "Health");
        assert_eq!(err.error.status(), Some(http::StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthenticated_not_retried() {
        let inner = Flaky::new(usize::MAX, || status(401, None));
        let err = service(inner.clone(), no_jitter()).oneshot(op()).await.unwrap_err();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.classification, ErrorClassification::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_budget() {
        let inner = Flaky::new(usize::MAX, || LinkError::Timeout(Duration::from_secs(30)));
        let err = service(inner.clone(), no_jitter()).oneshot(op()).await.unwrap_err();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.classification, ErrorClassification::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_wins_over_backoff() {
        let inner = Flaky::new(1, || status(503, Some(Duration::from_secs(3))));
        let execution = service(inner.clone(), no_jitter()).oneshot(op()).await.unwrap();

        assert_eq!(inner.gaps_ms(), [3000]);
        assert_eq!(execution.meta().attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_refused_connections() {
        let inner = Flaky::new(2, || LinkError::Transport("connection refused".into()));
        let execution = service(inner.clone(), no_jitter()).oneshot(op()).await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(execution.meta().attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let inner = Flaky::new(usize::MAX, || status(503, None));
        let op = op();
        let token = op.cancellation().clone();
        let call = tokio::spawn(service(inner.clone(), no_jitter()).oneshot(op));

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        let err = call.await.unwrap().unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
