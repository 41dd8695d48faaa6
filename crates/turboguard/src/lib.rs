//! # TurboGuard
//!
//! Resilience middleware for AI provider calls:
//! - Priority-ordered, runtime-adjustable middleware chain
//! - Retries with exponential backoff and jitter
//! - Failure-rate circuit breaker with half-open probing
//! - Fixed-window rate limiting
//! - Per-target latency and error monitoring
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use turboguard::{PipelineBuilder, Request, Response, handler_fn};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = PipelineBuilder::new().build()?;
//!
//!     let provider = handler_fn(|request| async move {
//!         // Call the model here
//!         Ok(Response::for_request(&request, json!({"text": "Hello!"})))
//!     });
//!
//!     let mut request = Request::new("claude-sonnet", json!({"prompt": "Hi"}))
//!         .with_timeout(Duration::from_secs(30));
//!     let response = pipeline.chain.execute(&mut request, &provider).await?;
//!
//!     println!("{}", response.payload());
//!     if let Some(monitor) = &pipeline.monitoring {
//!         println!("{:?}", monitor.snapshot());
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Re-export commonly used types
pub use builder::{Pipeline, PipelineBuilder, build_chain};
pub use chain::{MiddlewareChain, PriorityOrder};
pub use config::{PipelineConfig, Priorities};
pub use middleware::{
    CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerMiddleware, CircuitState, Handler,
    HandlerFn, LastError, Middleware, MonitoringMiddleware, MonitoringSnapshot, Next,
    RateLimitConfig, RateLimitMiddleware, RateLimitStats, RetryMiddleware, RetryPolicy,
    TargetSnapshot, handler_fn,
};
pub use turboguard_core::{Error, ErrorKind, Metadata, Request, Response, Result, keys};

// Module declarations
pub mod builder;
pub mod chain;
pub mod config;
pub mod middleware;
pub mod observability;

// Re-export key dependencies for convenience
pub use async_trait::async_trait;
pub use serde_json::Value as JsonValue;

/// Prelude module for convenient imports
///
/// ```rust
/// use turboguard::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Error, ErrorKind, Handler, Middleware, MiddlewareChain, Next, PipelineBuilder,
        PipelineConfig, Request, Response, Result, async_trait, handler_fn,
    };
    pub use turboguard_core::retry::{BackoffStrategy, ExponentialBackoff};
}

/// Version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
