//! Retry middleware with exponential backoff.

use super::{Middleware, Next};
use crate::observability;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;
use turboguard_core::retry::{BackoffStrategy, ExponentialBackoff};
use turboguard_core::{Error, ErrorKind, Request, Response, Result, keys};

/// Default middleware name.
pub const DEFAULT_NAME: &str = "retry";

/// Immutable retry configuration: a backoff schedule plus the failure kinds
/// that are never retried.
///
/// # Examples
///
/// ```rust
/// use turboguard::RetryPolicy;
/// use turboguard_core::ErrorKind;
/// use turboguard_core::retry::ExponentialBackoff;
///
/// let policy = RetryPolicy::new(ExponentialBackoff::builder().max_retries(2).build())
///     .retry_on(ErrorKind::RateLimited);
///
/// assert!(!policy.is_non_retryable(ErrorKind::RateLimited));
/// assert!(policy.is_non_retryable(ErrorKind::CircuitOpen));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(flatten)]
    backoff: ExponentialBackoff,
    non_retryable: HashSet<ErrorKind>,
}

impl RetryPolicy {
    /// Create a policy with the default non-retryable kinds.
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            backoff,
            non_retryable: default_non_retryable(),
        }
    }

    /// Replace the backoff schedule, keeping the non-retryable kinds.
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// The backoff schedule.
    pub fn backoff(&self) -> &ExponentialBackoff {
        &self.backoff
    }

    /// Maximum number of retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.backoff.max_retries()
    }

    /// Never retry failures of `kind`.
    pub fn never_retry(mut self, kind: ErrorKind) -> Self {
        self.non_retryable.insert(kind);
        self
    }

    /// Allow retrying failures of `kind`.
    pub fn retry_on(mut self, kind: ErrorKind) -> Self {
        self.non_retryable.remove(&kind);
        self
    }

    /// Whether `kind` is excluded from retries.
    pub fn is_non_retryable(&self, kind: ErrorKind) -> bool {
        self.non_retryable.contains(&kind)
    }

    /// Whether `error`, observed after `retries` retries, qualifies for
    /// another attempt.
    ///
    /// Excluded kinds are never retried; everything else is left to the
    /// backoff strategy.
    pub fn is_retryable(&self, error: &Error, retries: u32) -> bool {
        !self.is_non_retryable(error.kind()) && self.backoff.should_retry(error, retries)
    }

    /// Check the backoff parameters.
    pub fn validate(&self) -> Result<()> {
        self.backoff.validate()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

/// Kinds that are synthesized locally or final by construction.
fn default_non_retryable() -> HashSet<ErrorKind> {
    [
        ErrorKind::Cancelled,
        ErrorKind::CircuitOpen,
        ErrorKind::RateLimited,
        ErrorKind::RetriesExhausted,
        ErrorKind::Configuration,
    ]
    .into_iter()
    .collect()
}

/// Re-invokes the downstream pipeline on retryable failures.
///
/// The downstream is invoked at most `max_retries + 1` times. The number of
/// retries performed is written to the request metadata under
/// [`keys::RETRY_ATTEMPTS`]. When the budget runs out the last failure is
/// wrapped in [`Error::RetriesExhausted`], which names this middleware and
/// carries the attempt count.
///
/// Non-retryable failures propagate unchanged, even after earlier retries.
/// Their attempt count is still available from the request metadata under
/// [`keys::RETRY_ATTEMPTS`].
#[derive(Debug)]
pub struct RetryMiddleware {
    name: String,
    policy: RetryPolicy,
}

impl RetryMiddleware {
    /// Create a retry middleware, validating the policy.
    pub fn new(policy: RetryPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            name: DEFAULT_NAME.to_string(),
            policy,
        })
    }

    /// Override the registration name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The active policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, request: &mut Request, next: Next<'_>) -> Result<Response> {
        let mut retries: u32 = 0;
        request.metadata_mut().insert(keys::RETRY_ATTEMPTS, 0u64);

        loop {
            let error = match next.run(request).await {
                Ok(response) => {
                    if retries > 0 {
                        debug!(
                            middleware = %self.name,
                            call_target = %request.target(),
                            retries,
                            "Call succeeded after retrying"
                        );
                    }
                    return Ok(response);
                }
                Err(error) => error,
            };

            let attempts = retries + 1;
            if !self.policy.is_retryable(&error, retries) {
                debug!(
                    middleware = %self.name,
                    call_target = %request.target(),
                    kind = %error.kind(),
                    attempts,
                    "Failure is not retryable"
                );
                return Err(error);
            }

            let Some(delay) = self.policy.backoff.next_delay(retries) else {
                observability::log_retries_exhausted(&self.name, request, attempts, &error);
                return Err(Error::RetriesExhausted {
                    retrier: self.name.clone(),
                    attempts,
                    source: Box::new(error),
                });
            };

            if request.remaining().is_some_and(|left| delay >= left) {
                observability::log_retry_past_deadline(&self.name, request, attempts, &error);
                return Err(Error::timeout(self.name.clone()));
            }

            observability::log_retry_scheduled(&self.name, request, attempts, delay, &error);
            match request.cancellation().cloned() {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                },
                None => tokio::time::sleep(delay).await,
            }

            retries += 1;
            request
                .metadata_mut()
                .insert(keys::RETRY_ATTEMPTS, u64::from(retries));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{Handler, handler_fn};
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            ExponentialBackoff::builder()
                .max_retries(max_retries)
                .initial_interval(Duration::from_millis(100))
                .max_interval(Duration::from_secs(1))
                .jitter(false)
                .build(),
        )
    }

    /// Fails `failures` times with `error`, then succeeds.
    fn flaky(failures: u32, error: fn() -> Error) -> (impl Handler, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |request| {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(error())
                } else {
                    Ok(Response::for_request(&request, json!({"attempt": n + 1})))
                }
            }
        });
        (handler, calls)
    }

    async fn run(
        middleware: &RetryMiddleware,
        request: &mut Request,
        terminal: &dyn Handler,
    ) -> Result<Response> {
        middleware.handle(request, Next::new(&[], terminal)).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let retry = RetryMiddleware::new(policy(3)).unwrap();
        let (terminal, calls) = flaky(2, || Error::provider("connection reset"));
        let mut request = Request::new("chat", json!({}));

        let response = run(&retry, &mut request, &terminal).await.unwrap();

        assert_eq!(response.payload()["attempt"], 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(request.metadata().get_u64(keys::RETRY_ATTEMPTS), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_invokes_exactly_budget_plus_one() {
        let retry = RetryMiddleware::new(policy(4)).unwrap();
        let (terminal, calls) = flaky(u32::MAX, || Error::provider_status(503, "unavailable"));
        let mut request = Request::new("chat", json!({}));

        let err = run(&retry, &mut request, &terminal).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
        assert_eq!(err.attempts(), Some(5));
        assert_eq!(err.origin(), Some(DEFAULT_NAME));
        assert_eq!(err.root_cause().kind(), ErrorKind::Provider);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_names_the_middleware() {
        let retry = RetryMiddleware::new(policy(1)).unwrap().with_name("chat-retry");
        let (terminal, _calls) = flaky(u32::MAX, || Error::provider("refused"));
        let mut request = Request::new("chat", json!({}));

        let err = run(&retry, &mut request, &terminal).await.unwrap_err();

        assert_matches!(
            &err,
            Error::RetriesExhausted { retrier, attempts: 2, .. } if retrier == "chat-retry"
        );
        assert!(err.to_string().contains("'chat-retry'"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_after_retries_keeps_count_in_metadata() {
        let retry = RetryMiddleware::new(policy(3)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let terminal = handler_fn(move |_request| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::provider_status(503, "unavailable"))
                } else {
                    Err(Error::provider_status(401, "bad key"))
                }
            }
        });
        let mut request = Request::new("chat", json!({}));

        let err = run(&retry, &mut request, &terminal).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert_eq!(request.metadata().get_u64(keys::RETRY_ATTEMPTS), Some(1));
    }

    #[test]
    fn test_retryability_defers_to_strategy_after_kind_check() {
        let policy = policy(3);

        assert!(policy.is_retryable(&Error::provider_status(503, "unavailable"), 0));
        assert!(policy.is_retryable(&Error::timeout("provider"), 2));
        // Permanent per the strategy's classification
        assert!(!policy.is_retryable(&Error::provider_status(401, "bad key"), 0));
        // Transient, but excluded by kind
        assert!(!policy.is_retryable(&Error::Cancelled, 0));
        assert!(policy.retry_on(ErrorKind::Cancelled).is_retryable(&Error::Cancelled, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_single_attempt() {
        let retry = RetryMiddleware::new(policy(0)).unwrap();
        let (terminal, calls) = flaky(u32::MAX, || Error::provider("refused"));
        let mut request = Request::new("chat", json!({}));

        let err = run(&retry, &mut request, &terminal).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), Some(1));
        assert_eq!(request.metadata().get_u64(keys::RETRY_ATTEMPTS), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_kind_fails_fast_unwrapped() {
        let retry = RetryMiddleware::new(policy(3)).unwrap();
        let (terminal, calls) = flaky(u32::MAX, || Error::CircuitOpen {
            breaker: "downstream".to_string(),
            retry_in: Duration::from_secs(1),
        });
        let mut request = Request::new("chat", json!({}));

        let err = run(&retry, &mut request, &terminal).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_provider_status_is_not_retried() {
        let retry = RetryMiddleware::new(policy(3)).unwrap();
        let (terminal, calls) = flaky(u32::MAX, || Error::provider_status(401, "bad key"));
        let mut request = Request::new("chat", json!({}));

        let err = run(&retry, &mut request, &terminal).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::Provider);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_retryable_when_opted_in() {
        let retry = RetryMiddleware::new(policy(2).retry_on(ErrorKind::RateLimited)).unwrap();
        let (terminal, calls) = flaky(1, || Error::RateLimited {
            limiter: "rl".to_string(),
            retry_after: Duration::from_millis(10),
        });
        let mut request = Request::new("chat", json!({}));

        assert!(run(&retry, &mut request, &terminal).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_follow_backoff_schedule() {
        let retry = RetryMiddleware::new(policy(3)).unwrap();
        let (terminal, _calls) = flaky(3, || Error::provider("flaky"));
        let mut request = Request::new("chat", json!({}));

        let started = tokio::time::Instant::now();
        run(&retry, &mut request, &terminal).await.unwrap();

        // 100ms + 200ms + 400ms
        assert_eq!(started.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_not_scheduled_past_deadline() {
        let retry = RetryMiddleware::new(policy(5)).unwrap();
        let (terminal, calls) = flaky(u32::MAX, || Error::provider("flaky"));
        // First wait is 100ms, second 200ms: only one retry fits in 250ms
        let mut request = Request::new("chat", json!({})).with_timeout(Duration::from_millis(250));

        let err = run(&retry, &mut request, &terminal).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.origin(), Some(DEFAULT_NAME));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let retry = RetryMiddleware::new(policy(5)).unwrap();
        let (terminal, calls) = flaky(u32::MAX, || Error::provider("flaky"));
        let token = tokio_util::sync::CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let mut request = Request::new("chat", json!({})).with_cancellation(token);

        let err = run(&retry, &mut request, &terminal).await.unwrap_err();

        assert_matches!(err, Error::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let bad = RetryPolicy::new(ExponentialBackoff::builder().multiplier(0.1).build());
        let err = RetryMiddleware::new(bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_policy_deserializes_flat() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_retries": 1, "jitter": false, "non_retryable": ["cancelled"]}"#,
        )
        .unwrap();

        assert_eq!(policy.max_retries(), 1);
        assert!(!policy.backoff().jitter());
        assert!(policy.is_non_retryable(ErrorKind::Cancelled));
        assert!(!policy.is_non_retryable(ErrorKind::RateLimited));
    }
}
