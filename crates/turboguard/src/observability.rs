//! Centralized structured logging for the resilience pipeline
//!
//! Every middleware reports through these helpers so field names stay
//! consistent across retry, circuit breaker, rate limiter and monitoring
//! events. Nothing here alters control flow.

use crate::middleware::CircuitState;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use turboguard_core::{Error, Request};

/// Timer for measuring call latency.
///
/// Uses the tokio clock so paused-time tests observe exact latencies.
#[derive(Debug, Clone, Copy)]
pub struct CallTimer {
    start: Instant,
}

impl CallTimer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Log a retry about to be scheduled
pub fn log_retry_scheduled(
    middleware: &str,
    request: &Request,
    attempts: u32,
    delay: Duration,
    error: &Error,
) {
    warn!(
        middleware = %middleware,
        request_id = %request.id(),
        call_target = %request.target(),
        attempts,
        delay_ms = delay.as_millis(),
        kind = %error.kind(),
        error = %error,
        "Retrying provider call"
    );
}

/// Log a spent retry budget
pub fn log_retries_exhausted(middleware: &str, request: &Request, attempts: u32, error: &Error) {
    warn!(
        middleware = %middleware,
        request_id = %request.id(),
        call_target = %request.target(),
        attempts,
        error = %error,
        "Retry budget exhausted"
    );
}

/// Log a retry abandoned because it would start after the deadline
pub fn log_retry_past_deadline(middleware: &str, request: &Request, attempts: u32, error: &Error) {
    warn!(
        middleware = %middleware,
        request_id = %request.id(),
        call_target = %request.target(),
        attempts,
        error = %error,
        "Next retry would start after the request deadline"
    );
}

/// Log a circuit breaker state transition
pub fn log_circuit_transition(breaker: &str, from: CircuitState, to: CircuitState) {
    match to {
        CircuitState::Open => warn!(
            breaker = %breaker,
            from = %from,
            to = %to,
            "Circuit breaker opened"
        ),
        CircuitState::HalfOpen | CircuitState::Closed => info!(
            breaker = %breaker,
            from = %from,
            to = %to,
            "Circuit breaker state changed"
        ),
    }
}

/// Log a call rejected by an open circuit
pub fn log_circuit_rejected(breaker: &str, request: &Request, retry_in: Duration) {
    debug!(
        breaker = %breaker,
        request_id = %request.id(),
        call_target = %request.target(),
        retry_in_ms = retry_in.as_millis(),
        "Circuit breaker rejected call"
    );
}

/// Log a call shed by a rate limiter
pub fn log_rate_limited(limiter: &str, request: &Request, retry_after: Duration) {
    debug!(
        limiter = %limiter,
        request_id = %request.id(),
        call_target = %request.target(),
        retry_after_ms = retry_after.as_millis(),
        "Rate limiter rejected call"
    );
}

/// Log the outcome observed by the monitoring middleware
pub fn log_call_observed(request: &Request, latency: Duration, error: Option<&Error>) {
    match error {
        None => debug!(
            request_id = %request.id(),
            call_target = %request.target(),
            elapsed_ms = latency.as_millis(),
            "Provider call succeeded"
        ),
        Some(error) => debug!(
            request_id = %request.id(),
            call_target = %request.target(),
            elapsed_ms = latency.as_millis(),
            kind = %error.kind(),
            error = %error,
            "Provider call failed"
        ),
    }
}

/// Log chain administration (add/remove/enable/disable)
pub fn log_chain_change(action: &str, middleware: &str, priority: Option<i32>) {
    info!(
        action = %action,
        middleware = %middleware,
        priority,
        "Middleware chain updated"
    );
}

/// Install a `tracing-subscriber` formatter driven by `RUST_LOG`.
///
/// Returns an error if a global subscriber is already installed.
#[cfg(feature = "trace")]
pub fn init_tracing() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_call_timer_uses_tokio_clock() {
        let timer = CallTimer::start();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(timer.elapsed(), Duration::from_millis(40));
    }

    #[test]
    fn test_logging_helpers_do_not_panic_without_subscriber() {
        let request = Request::new("chat", json!(null));
        let error = Error::provider("boom");

        log_retry_scheduled("retry", &request, 1, Duration::from_millis(5), &error);
        log_retries_exhausted("retry", &request, 3, &error);
        log_circuit_transition("cb", CircuitState::Closed, CircuitState::Open);
        log_call_observed(&request, Duration::from_millis(1), Some(&error));
        log_chain_change("add", "retry", Some(40));
    }
}
