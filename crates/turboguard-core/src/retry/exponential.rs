//! Exponential backoff with optional jitter.

use super::strategy::BackoffStrategy;
use crate::error::{Error, Result};
use crate::serde_ext::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Exponential backoff strategy.
///
/// Delays grow as `initial_interval * multiplier^attempt`, capped at
/// `max_interval`.
///
/// # Mathematical Formula
///
/// For retry number `n` (0-indexed after the first failure):
/// ```text
/// wait = min(max_interval, initial_interval * multiplier^n)
/// with jitter: wait = wait/2 + random(0, wait/2)
/// ```
///
/// Jitter therefore never lengthens a wait, it only spreads synchronized
/// callers over the upper half of the interval.
///
/// # Examples
///
/// ```rust
/// use turboguard_core::retry::ExponentialBackoff;
/// use std::time::Duration;
///
/// // Default configuration (max_retries=3, initial=100ms, max=10s, multiplier=2.0, jitter on)
/// let backoff = ExponentialBackoff::default();
///
/// // Custom configuration
/// let backoff = ExponentialBackoff::builder()
///     .max_retries(5)
///     .initial_interval(Duration::from_millis(100))
///     .max_interval(Duration::from_secs(30))
///     .multiplier(2.0)
///     .jitter(true)
///     .build();
/// assert!(backoff.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExponentialBackoff {
    max_retries: u32,
    #[serde(rename = "initial_interval_ms", with = "duration_ms")]
    initial_interval: Duration,
    #[serde(rename = "max_interval_ms", with = "duration_ms")]
    max_interval: Duration,
    multiplier: f64,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Create a new builder for configuring exponential backoff.
    pub fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder::default()
    }

    /// Initial interval before the first retry.
    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    /// Upper bound for any single wait.
    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// Growth factor between consecutive waits.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Whether waits are randomized.
    pub fn jitter(&self) -> bool {
        self.jitter
    }

    /// Check the parameters for values that would make the schedule meaningless.
    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::configuration(format!(
                "backoff multiplier must be a finite value >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_interval.is_zero() {
            return Err(Error::configuration("backoff max_interval must be positive"));
        }
        if self.initial_interval > self.max_interval {
            return Err(Error::configuration(format!(
                "backoff initial_interval ({:?}) exceeds max_interval ({:?})",
                self.initial_interval, self.max_interval
            )));
        }
        Ok(())
    }

    /// The un-jittered wait for retry number `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);

        // f64::min ignores NaN, and inf collapses onto the cap
        let capped = raw.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl Default for ExponentialBackoff {
    /// Defaults:
    /// - `max_retries`: 3
    /// - `initial_interval`: 100ms
    /// - `max_interval`: 10s
    /// - `multiplier`: 2.0 (doubles each time)
    /// - `jitter`: enabled
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: true,
        }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }

        let wait = self.base_delay(attempt);
        if !self.jitter {
            return Some(wait);
        }

        let half = wait.as_secs_f64() / 2.0;
        Some(Duration::from_secs_f64(half + rand::random::<f64>() * half))
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Builder for configuring `ExponentialBackoff`.
///
/// # Examples
///
/// ```rust
/// use turboguard_core::retry::ExponentialBackoff;
/// use std::time::Duration;
///
/// let backoff = ExponentialBackoff::builder()
///     .max_retries(5)
///     .initial_interval(Duration::from_millis(100))
///     .max_interval(Duration::from_secs(30))
///     .multiplier(1.5)
///     .jitter(false)
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct ExponentialBackoffBuilder {
    max_retries: Option<u32>,
    initial_interval: Option<Duration>,
    max_interval: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<bool>,
}

impl ExponentialBackoffBuilder {
    /// Set the maximum number of retry attempts.
    ///
    /// Default: 3. Zero means exactly one attempt.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the wait before the first retry.
    ///
    /// Default: 100ms
    pub fn initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = Some(interval);
        self
    }

    /// Set the maximum wait between retries.
    ///
    /// Default: 10s
    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = Some(interval);
        self
    }

    /// Set the exponential multiplier.
    ///
    /// Default: 2.0 (doubles each time)
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Enable or disable jitter.
    ///
    /// Default: enabled
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Build the `ExponentialBackoff` instance.
    ///
    /// Uses default values for any unset parameters. Call
    /// [`ExponentialBackoff::validate`] (or [`Self::try_build`]) before use.
    pub fn build(self) -> ExponentialBackoff {
        ExponentialBackoff {
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            initial_interval: self.initial_interval.unwrap_or(DEFAULT_INITIAL_INTERVAL),
            max_interval: self.max_interval.unwrap_or(DEFAULT_MAX_INTERVAL),
            multiplier: self.multiplier.unwrap_or(DEFAULT_MULTIPLIER),
            jitter: self.jitter.unwrap_or(true),
        }
    }

    /// Build and validate in one step.
    pub fn try_build(self) -> Result<ExponentialBackoff> {
        let backoff = self.build();
        backoff.validate()?;
        Ok(backoff)
    }
}
