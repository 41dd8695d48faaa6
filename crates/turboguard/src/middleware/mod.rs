//! Middleware abstraction for provider calls.
//!
//! A [`Middleware`] receives the request and a [`Next`] handle standing for
//! "the rest of the pipeline". It either delegates by awaiting
//! [`Next::run`] (possibly more than once, as retry does) or short-circuits
//! with its own response or failure.
//!
//! The innermost link is a [`Handler`]: the actual provider call, supplied
//! by the caller of [`MiddlewareChain::execute`](crate::MiddlewareChain::execute).

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::trace;
use turboguard_core::{Error, Request, Response, Result};

pub mod circuit_breaker;
pub mod monitoring;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerMiddleware, CircuitState,
};
pub use monitoring::{LastError, MonitoringMiddleware, MonitoringSnapshot, TargetSnapshot};
pub use rate_limit::{RateLimitConfig, RateLimitMiddleware, RateLimitStats};
pub use retry::{RetryMiddleware, RetryPolicy};

/// A unit of cross-cutting behavior around a provider call.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used by the chain for enable/disable/remove.
    fn name(&self) -> &str;

    /// Process a request, delegating downstream through `next` as needed.
    async fn handle(&self, request: &mut Request, next: Next<'_>) -> Result<Response>;
}

/// The terminal provider call at the end of a chain.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Perform the call.
    async fn call(&self, request: &Request) -> Result<Response>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn call(&self, request: &Request) -> Result<Response> {
        (**self).call(request).await
    }
}

/// Handler adapter for async closures. See [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn").finish_non_exhaustive()
    }
}

/// Wrap an async closure as a terminal [`Handler`].
///
/// The closure receives its own clone of the request.
///
/// # Examples
///
/// ```rust
/// use turboguard::{handler_fn, Response};
/// use serde_json::json;
///
/// let terminal = handler_fn(|request| async move {
///     Ok(Response::for_request(&request, json!({"text": "hi"})))
/// });
/// # let _ = terminal;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    async fn call(&self, request: &Request) -> Result<Response> {
        (self.f)(request.clone()).await
    }
}

/// The remainder of a chain as seen from one middleware.
///
/// `Next` is `Copy`, so a middleware may run the downstream pipeline several
/// times within one call.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(middlewares: &'a [Arc<dyn Middleware>], terminal: &'a dyn Handler) -> Self {
        Self {
            middlewares,
            terminal,
        }
    }

    /// Number of middlewares left before the terminal handler.
    pub fn remaining(&self) -> usize {
        self.middlewares.len()
    }

    /// Run the rest of the pipeline.
    pub async fn run(self, request: &mut Request) -> Result<Response> {
        match self.middlewares.split_first() {
            Some((current, rest)) => {
                trace!(
                    middleware = current.name(),
                    remaining = rest.len(),
                    request_id = %request.id(),
                    "Entering middleware"
                );
                current.handle(request, Next::new(rest, self.terminal)).await
            }
            None => call_terminal(self.terminal, request).await,
        }
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field(
                "middlewares",
                &self.middlewares.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// Invoke the terminal handler, abandoning it at the request deadline or on
/// cancellation.
async fn call_terminal(terminal: &dyn Handler, request: &Request) -> Result<Response> {
    if request.is_cancelled() {
        return Err(Error::Cancelled);
    }
    if request.remaining().is_some_and(|left| left.is_zero()) {
        return Err(Error::timeout("deadline"));
    }

    let guarded = async {
        match request.deadline() {
            Some(deadline) => tokio::time::timeout_at(deadline, terminal.call(request))
                .await
                .unwrap_or_else(|_| Err(Error::timeout("deadline"))),
            None => terminal.call(request).await,
        }
    };

    match request.cancellation() {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = guarded => result,
        },
        None => guarded.await,
    }
}
