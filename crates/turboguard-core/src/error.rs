//! Failure taxonomy for the TurboGuard pipeline.
//!
//! Every failure that crosses a middleware boundary is an [`Error`]. Retry and
//! circuit-breaker logic branch on [`Error::kind`] rather than on the concrete
//! variant, so new provider adapters only need to pick the right constructor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for operations that can fail with a pipeline error.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failure, independent of the context it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The downstream provider call failed.
    Provider,
    /// A deadline elapsed, either at the provider or in the pipeline.
    Timeout,
    /// The caller cancelled the call.
    Cancelled,
    /// A circuit breaker rejected the call without invoking downstream.
    CircuitOpen,
    /// A rate limiter rejected the call without invoking downstream.
    RateLimited,
    /// The retry budget was spent; wraps the last underlying failure.
    RetriesExhausted,
    /// Invalid policy values were supplied at construction.
    Configuration,
}

impl ErrorKind {
    /// Stable snake_case name, used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Provider => "provider",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::RetriesExhausted => "retries_exhausted",
            ErrorKind::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for pipeline calls.
#[derive(Debug, Error)]
pub enum Error {
    /// The provider call failed for a provider-specific reason.
    #[error("Provider error: {message}")]
    Provider {
        /// Error message reported by the provider client
        message: String,
        /// HTTP-like status code, when the provider reported one
        status: Option<u16>,
        /// Whether repeating the same request may succeed
        transient: bool,
    },

    /// A deadline elapsed.
    #[error("Timed out in {origin}")]
    Timeout {
        /// Where the deadline was observed (`provider`, `deadline`, ...)
        origin: String,
    },

    /// The call was cancelled by its owner.
    #[error("Call cancelled")]
    Cancelled,

    /// A circuit breaker is rejecting calls.
    #[error("Circuit '{breaker}' is open (retry in {retry_in:?})")]
    CircuitOpen {
        /// Name of the breaker that rejected the call
        breaker: String,
        /// Time left until the breaker admits a probe
        retry_in: Duration,
    },

    /// A rate limiter shed the call.
    #[error("Rate limited by '{limiter}' (retry after {retry_after:?})")]
    RateLimited {
        /// Name of the limiter that rejected the call
        limiter: String,
        /// Time until the next window opens
        retry_after: Duration,
    },

    /// The retry budget was spent.
    #[error("Retries exhausted in '{retrier}' after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Name of the retry middleware that gave up
        retrier: String,
        /// Total number of downstream invocations
        attempts: u32,
        /// The last underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Invalid configuration supplied at construction.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl Error {
    /// A transient provider failure with no status code (connection refused,
    /// reset, DNS failure, ...).
    pub fn provider(message: impl Into<String>) -> Self {
        Error::Provider {
            message: message.into(),
            status: None,
            transient: true,
        }
    }

    /// A provider failure classified from its status code.
    ///
    /// 5xx, 408, 409 and 429 are transient; every other status is permanent.
    pub fn provider_status(status: u16, message: impl Into<String>) -> Self {
        let transient = status >= 500 || matches!(status, 408 | 409 | 429);
        Error::Provider {
            message: message.into(),
            status: Some(status),
            transient,
        }
    }

    /// A timeout observed at `origin`.
    pub fn timeout(origin: impl Into<String>) -> Self {
        Error::Timeout {
            origin: origin.into(),
        }
    }

    /// An invalid configuration value.
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    /// The kind of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Provider { .. } => ErrorKind::Provider,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            Error::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether repeating the call could plausibly succeed.
    ///
    /// Only provider errors carry their own classification; every other kind
    /// is left to the retry policy's kind set.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Provider { transient, .. } => *transient,
            _ => true,
        }
    }

    /// True when a middleware refused the call without invoking downstream.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. } | Error::RateLimited { .. })
    }

    /// Number of downstream invocations behind this failure, when retried.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Error::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Name of the component that synthesized this failure, if any.
    pub fn origin(&self) -> Option<&str> {
        match self {
            Error::Timeout { origin } => Some(origin),
            Error::CircuitOpen { breaker, .. } => Some(breaker),
            Error::RateLimited { limiter, .. } => Some(limiter),
            Error::RetriesExhausted { retrier, .. } => Some(retrier),
            _ => None,
        }
    }

    /// The innermost failure, looking through `RetriesExhausted`.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RetriesExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Suggested wait before calling again, when the rejecting component knows it.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::CircuitOpen { retry_in, .. } => Some(*retry_in),
            Error::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Configuration(err.to_string())
    }
}
