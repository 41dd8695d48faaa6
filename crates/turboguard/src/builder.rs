//! Wiring a [`MiddlewareChain`] from configuration.

use crate::chain::{MiddlewareChain, PriorityOrder};
use crate::config::{PipelineConfig, Priorities};
use crate::middleware::{
    CircuitBreakerConfig, CircuitBreakerMiddleware, Middleware, MonitoringMiddleware,
    RateLimitConfig, RateLimitMiddleware, RetryMiddleware, RetryPolicy,
};
use std::sync::Arc;
use tracing::debug;
use turboguard_core::Result;

/// A configured chain plus handles to the stateful middlewares in it.
///
/// The handles share state with the instances registered in the chain, so
/// `pipeline.monitoring` reports on calls made through `pipeline.chain`.
#[derive(Debug)]
pub struct Pipeline {
    /// The wired chain
    pub chain: MiddlewareChain,
    /// Monitoring handle, when monitoring is enabled
    pub monitoring: Option<Arc<MonitoringMiddleware>>,
    /// Breaker handle, when a breaker is configured
    pub circuit_breaker: Option<Arc<CircuitBreakerMiddleware>>,
    /// Limiter handle, when rate limiting is configured
    pub rate_limiter: Option<Arc<RateLimitMiddleware>>,
}

/// Builder for [`Pipeline`].
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use turboguard::{PipelineBuilder, RateLimitConfig};
///
/// let pipeline = PipelineBuilder::new()
///     .rate_limit(RateLimitConfig::new(10, Duration::from_secs(1)))
///     .build()
///     .unwrap();
///
/// assert_eq!(
///     pipeline.chain.registered_names(),
///     vec!["monitoring", "rate-limit", "circuit-breaker", "retry"]
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
}

impl PipelineBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration, validating it.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
        })
    }

    /// Set the retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = Some(policy);
        self
    }

    /// Leave retries out.
    pub fn without_retry(mut self) -> Self {
        self.config.retry = None;
        self
    }

    /// Set the circuit breaker configuration.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = Some(config);
        self
    }

    /// Leave the circuit breaker out.
    pub fn without_circuit_breaker(mut self) -> Self {
        self.config.circuit_breaker = None;
        self
    }

    /// Enable rate limiting.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = Some(config);
        self
    }

    /// Toggle the monitoring middleware.
    pub fn monitoring(mut self, enabled: bool) -> Self {
        self.config.monitoring = enabled;
        self
    }

    /// Set the chain's priority order.
    pub fn ordering(mut self, ordering: PriorityOrder) -> Self {
        self.config.ordering = ordering;
        self
    }

    /// Override the built-in priorities.
    pub fn priorities(mut self, priorities: Priorities) -> Self {
        self.config.priorities = priorities;
        self
    }

    /// The configuration accumulated so far.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Instantiate and register every configured middleware.
    pub fn build(self) -> Result<Pipeline> {
        let PipelineConfig {
            retry,
            circuit_breaker,
            rate_limit,
            monitoring,
            ordering,
            priorities,
        } = self.config;

        let chain = MiddlewareChain::with_ordering(ordering);

        let monitoring = monitoring.then(|| Arc::new(MonitoringMiddleware::new()));
        if let Some(monitor) = &monitoring {
            chain.add_arc(Arc::clone(monitor) as Arc<dyn Middleware>, priorities.monitoring);
        }

        let rate_limiter = rate_limit
            .map(RateLimitMiddleware::new)
            .transpose()?
            .map(Arc::new);
        if let Some(limiter) = &rate_limiter {
            chain.add_arc(Arc::clone(limiter) as Arc<dyn Middleware>, priorities.rate_limit);
        }

        let circuit_breaker = circuit_breaker
            .map(CircuitBreakerMiddleware::new)
            .transpose()?
            .map(Arc::new);
        if let Some(breaker) = &circuit_breaker {
            chain.add_arc(
                Arc::clone(breaker) as Arc<dyn Middleware>,
                priorities.circuit_breaker,
            );
        }

        if let Some(policy) = retry {
            chain.add(RetryMiddleware::new(policy)?, priorities.retry);
        }

        debug!(middlewares = ?chain.registered_names(), "Pipeline built");

        Ok(Pipeline {
            chain,
            monitoring,
            circuit_breaker,
            rate_limiter,
        })
    }
}

/// Build just the chain described by `config`.
pub fn build_chain(config: &PipelineConfig) -> Result<MiddlewareChain> {
    Ok(PipelineBuilder::from_config(config)?.build()?.chain)
}
