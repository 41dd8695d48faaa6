//! Pipeline configuration.
//!
//! A [`PipelineConfig`] describes which middlewares to install, their
//! settings and their priorities. It deserializes from any serde format with
//! durations in milliseconds, and can be loaded from `TURBOGUARD_*`
//! environment variables.

use crate::chain::PriorityOrder;
use crate::middleware::{CircuitBreakerConfig, RateLimitConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use turboguard_core::Result;

/// Chain priorities for the built-in middlewares.
///
/// With ascending order, monitoring wraps everything so it observes the final
/// outcome of each logical call, including rejections and exhausted retries.
/// Retry sits innermost, so a logical call takes one rate-limit slot and
/// records one breaker outcome however many attempts it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Priorities {
    /// Monitoring priority (default 10)
    pub monitoring: i32,
    /// Rate limiter priority (default 20)
    pub rate_limit: i32,
    /// Circuit breaker priority (default 30)
    pub circuit_breaker: i32,
    /// Retry priority (default 40)
    pub retry: i32,
}

impl Default for Priorities {
    fn default() -> Self {
        Self {
            monitoring: 10,
            rate_limit: 20,
            circuit_breaker: 30,
            retry: 40,
        }
    }
}

/// Configuration for a resilience pipeline.
///
/// `None` leaves the corresponding middleware out of the chain.
///
/// # Examples
///
/// ```rust
/// use turboguard::PipelineConfig;
///
/// let config: PipelineConfig = serde_json::from_str(r#"{
///     "retry": { "max_retries": 2, "initial_interval_ms": 50 },
///     "rate_limit": { "limit": 100, "window_ms": 1000 }
/// }"#).unwrap();
///
/// assert_eq!(config.retry.unwrap().max_retries(), 2);
/// assert!(config.circuit_breaker.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Retry policy
    pub retry: Option<RetryPolicy>,

    /// Circuit breaker thresholds
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Rate limit (disabled unless configured)
    pub rate_limit: Option<RateLimitConfig>,

    /// Whether to install the monitoring middleware
    pub monitoring: bool,

    /// How priorities map to nesting
    pub ordering: PriorityOrder,

    /// Per-middleware priorities
    pub priorities: Priorities,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: Some(RetryPolicy::default()),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
            rate_limit: None,
            monitoring: true,
            ordering: PriorityOrder::Ascending,
            priorities: Priorities::default(),
        }
    }
}

impl PipelineConfig {
    /// A configuration with every middleware turned off.
    pub fn empty() -> Self {
        Self {
            retry: None,
            circuit_breaker: None,
            rate_limit: None,
            monitoring: false,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables, on top of the defaults.
    ///
    /// This will look for:
    /// - `TURBOGUARD_RETRY_ENABLED` to turn retries off (`false`)
    /// - `TURBOGUARD_MAX_RETRIES` for the retry budget
    /// - `TURBOGUARD_RETRY_INITIAL_MS` / `TURBOGUARD_RETRY_MAX_MS` for the backoff bounds
    /// - `TURBOGUARD_RETRY_MULTIPLIER` for the backoff growth factor
    /// - `TURBOGUARD_RETRY_JITTER` to toggle jitter
    /// - `TURBOGUARD_CIRCUIT_BREAKER_ENABLED` to turn the breaker off (`false`)
    /// - `TURBOGUARD_FAILURE_RATE_THRESHOLD` for the breaker threshold
    /// - `TURBOGUARD_MINIMUM_CALLS` for the breaker's evaluation floor
    /// - `TURBOGUARD_OPEN_DURATION_MS` for the breaker cooldown
    /// - `TURBOGUARD_HALF_OPEN_CALLS` for the probe quota
    /// - `TURBOGUARD_RATE_LIMIT` and `TURBOGUARD_RATE_WINDOW_MS` to enable rate limiting
    /// - `TURBOGUARD_MONITORING` to toggle monitoring
    ///
    /// Unparsable values are rejected with a configuration error.
    #[cfg(feature = "env")]
    pub fn from_env() -> Result<Self> {
        use std::time::Duration;
        use turboguard_core::retry::{BackoffStrategy, ExponentialBackoff};

        let mut config = Self::default();

        // Retry
        if env_parse::<bool>("TURBOGUARD_RETRY_ENABLED")? == Some(false) {
            config.retry = None;
        }
        if let Some(policy) = config.retry.take() {
            let current = policy.backoff().clone();
            let backoff = ExponentialBackoff::builder()
                .max_retries(env_parse("TURBOGUARD_MAX_RETRIES")?.unwrap_or(current.max_retries()))
                .initial_interval(
                    env_parse("TURBOGUARD_RETRY_INITIAL_MS")?
                        .map_or(current.initial_interval(), Duration::from_millis),
                )
                .max_interval(
                    env_parse("TURBOGUARD_RETRY_MAX_MS")?
                        .map_or(current.max_interval(), Duration::from_millis),
                )
                .multiplier(
                    env_parse("TURBOGUARD_RETRY_MULTIPLIER")?.unwrap_or(current.multiplier()),
                )
                .jitter(env_parse("TURBOGUARD_RETRY_JITTER")?.unwrap_or(current.jitter()))
                .build();
            config.retry = Some(policy.with_backoff(backoff));
        }

        // Circuit breaker
        if env_parse::<bool>("TURBOGUARD_CIRCUIT_BREAKER_ENABLED")? == Some(false) {
            config.circuit_breaker = None;
        }
        if let Some(breaker) = config.circuit_breaker.as_mut() {
            if let Some(threshold) = env_parse("TURBOGUARD_FAILURE_RATE_THRESHOLD")? {
                breaker.failure_rate_threshold = threshold;
            }
            if let Some(minimum_calls) = env_parse("TURBOGUARD_MINIMUM_CALLS")? {
                breaker.minimum_calls = minimum_calls;
            }
            if let Some(open_ms) = env_parse("TURBOGUARD_OPEN_DURATION_MS")? {
                breaker.open_duration = Duration::from_millis(open_ms);
            }
            if let Some(probes) = env_parse("TURBOGUARD_HALF_OPEN_CALLS")? {
                breaker.permitted_calls_in_half_open = probes;
            }
        }

        // Rate limit
        if let Some(limit) = env_parse("TURBOGUARD_RATE_LIMIT")? {
            let mut rate_limit = RateLimitConfig {
                limit,
                ..Default::default()
            };
            if let Some(window_ms) = env_parse("TURBOGUARD_RATE_WINDOW_MS")? {
                rate_limit.window = Duration::from_millis(window_ms);
            }
            config.rate_limit = Some(rate_limit);
        }

        // Monitoring
        if let Some(monitoring) = env_parse("TURBOGUARD_MONITORING")? {
            config.monitoring = monitoring;
        }

        config.validate()?;
        Ok(config)
    }

    /// Merge this configuration with another, with the other taking precedence.
    ///
    /// Fields of `other` left at their defaults do not override `self`.
    pub fn merge(mut self, other: PipelineConfig) -> Self {
        let defaults = PipelineConfig::default();

        if other.retry.is_some() && other.retry != defaults.retry {
            self.retry = other.retry;
        }
        if other.circuit_breaker.is_some() && other.circuit_breaker != defaults.circuit_breaker {
            self.circuit_breaker = other.circuit_breaker;
        }
        if other.rate_limit.is_some() {
            self.rate_limit = other.rate_limit;
        }
        if other.monitoring != defaults.monitoring {
            self.monitoring = other.monitoring;
        }
        if other.ordering != defaults.ordering {
            self.ordering = other.ordering;
        }
        if other.priorities != defaults.priorities {
            self.priorities = other.priorities;
        }

        self
    }

    /// Validate every configured middleware.
    pub fn validate(&self) -> Result<()> {
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }
}

/// Read and parse an environment variable; `None` when unset.
#[cfg(feature = "env")]
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| {
                turboguard_core::Error::configuration(format!("invalid {key}={raw:?}: {e}"))
            }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(turboguard_core::Error::configuration(format!("invalid {key}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use turboguard_core::ErrorKind;
    use turboguard_core::retry::BackoffStrategy;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();

        assert_eq!(config.retry.as_ref().map(RetryPolicy::max_retries), Some(3));
        assert!(config.circuit_breaker.is_some());
        assert!(config.rate_limit.is_none());
        assert!(config.monitoring);
        assert_eq!(config.priorities.monitoring, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_deserialization() {
        let config: PipelineConfig = toml::from_str(
            r#"
            monitoring = false
            ordering = "descending"

            [retry]
            max_retries = 5
            initial_interval_ms = 200
            max_interval_ms = 2000
            jitter = false

            [circuit_breaker]
            name = "anthropic"
            failure_rate_threshold = 0.25
            minimum_calls = 20
            open_duration_ms = 5000

            [rate_limit]
            limit = 50
            window_ms = 1000

            [priorities]
            retry = 5
            "#,
        )
        .unwrap();

        let retry = config.retry.unwrap();
        assert_eq!(retry.max_retries(), 5);
        assert_eq!(retry.backoff().initial_interval(), Duration::from_millis(200));
        assert!(!retry.backoff().jitter());
        assert!(retry.is_non_retryable(ErrorKind::CircuitOpen));

        let breaker = config.circuit_breaker.unwrap();
        assert_eq!(breaker.name, "anthropic");
        assert_eq!(breaker.open_duration, Duration::from_secs(5));
        assert_eq!(breaker.permitted_calls_in_half_open, 3);

        assert_eq!(
            config.rate_limit.unwrap(),
            RateLimitConfig::new(50, Duration::from_secs(1))
        );
        assert!(!config.monitoring);
        assert_eq!(config.ordering, PriorityOrder::Descending);
        assert_eq!(config.priorities.retry, 5);
        assert_eq!(config.priorities.circuit_breaker, 30);
    }

    #[test]
    fn test_validate_reports_nested_errors() {
        let config = PipelineConfig {
            rate_limit: Some(RateLimitConfig::new(0, Duration::from_secs(1))),
            ..Default::default()
        };

        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_config_merge() {
        let base = PipelineConfig {
            rate_limit: Some(RateLimitConfig::new(10, Duration::from_secs(1))),
            ..Default::default()
        };
        let overrides = PipelineConfig {
            monitoring: false,
            priorities: Priorities {
                retry: 1,
                ..Default::default()
            },
            ..Default::default()
        };

        let merged = base.merge(overrides);

        assert!(!merged.monitoring);
        assert_eq!(merged.priorities.retry, 1);
        // Defaults in the override leave the base untouched
        assert_eq!(
            merged.rate_limit,
            Some(RateLimitConfig::new(10, Duration::from_secs(1)))
        );
        assert!(merged.retry.is_some());
    }

    #[cfg(feature = "env")]
    #[test]
    fn test_from_env() {
        temp_env::with_vars(
            [
                ("TURBOGUARD_MAX_RETRIES", Some("7")),
                ("TURBOGUARD_RETRY_INITIAL_MS", Some("20")),
                ("TURBOGUARD_RETRY_JITTER", Some("false")),
                ("TURBOGUARD_FAILURE_RATE_THRESHOLD", Some("0.75")),
                ("TURBOGUARD_OPEN_DURATION_MS", Some("1500")),
                ("TURBOGUARD_RATE_LIMIT", Some("120")),
                ("TURBOGUARD_RATE_WINDOW_MS", Some("60000")),
                ("TURBOGUARD_MONITORING", Some("false")),
            ],
            || {
                let config = PipelineConfig::from_env().unwrap();

                let retry = config.retry.unwrap();
                assert_eq!(retry.backoff().max_retries(), 7);
                assert_eq!(retry.backoff().initial_interval(), Duration::from_millis(20));
                assert!(!retry.backoff().jitter());

                let breaker = config.circuit_breaker.unwrap();
                assert_eq!(breaker.failure_rate_threshold, 0.75);
                assert_eq!(breaker.open_duration, Duration::from_millis(1500));

                assert_eq!(
                    config.rate_limit.unwrap(),
                    RateLimitConfig::new(120, Duration::from_secs(60))
                );
                assert!(!config.monitoring);
            },
        );
    }

    #[cfg(feature = "env")]
    #[test]
    fn test_from_env_disables_middlewares() {
        temp_env::with_vars(
            [
                ("TURBOGUARD_RETRY_ENABLED", Some("false")),
                ("TURBOGUARD_CIRCUIT_BREAKER_ENABLED", Some("false")),
                ("TURBOGUARD_RATE_LIMIT", None),
            ],
            || {
                let config = PipelineConfig::from_env().unwrap();
                assert!(config.retry.is_none());
                assert!(config.circuit_breaker.is_none());
                assert!(config.rate_limit.is_none());
            },
        );
    }

    #[cfg(feature = "env")]
    #[test]
    fn test_from_env_rejects_garbage() {
        temp_env::with_var("TURBOGUARD_MAX_RETRIES", Some("many"), || {
            let err = PipelineConfig::from_env().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration);
            assert!(err.to_string().contains("TURBOGUARD_MAX_RETRIES"));
        });

        temp_env::with_var("TURBOGUARD_FAILURE_RATE_THRESHOLD", Some("3.0"), || {
            assert!(PipelineConfig::from_env().is_err());
        });
    }
}
