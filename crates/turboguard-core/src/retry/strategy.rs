//! The backoff strategy abstraction.

use crate::error::Error;
use std::time::Duration;

/// A strategy that decides how long to wait between attempts and when to stop.
///
/// Strategies are pure: they hold no per-call state, so a single instance can
/// be shared by every concurrent call that goes through a retry middleware.
///
/// # Examples
///
/// ```rust
/// use turboguard_core::retry::{BackoffStrategy, ExponentialBackoff};
/// use std::time::Duration;
///
/// let backoff = ExponentialBackoff::builder()
///     .max_retries(3)
///     .initial_interval(Duration::from_millis(100))
///     .jitter(false)
///     .build();
///
/// assert_eq!(backoff.next_delay(0), Some(Duration::from_millis(100)));
/// assert_eq!(backoff.next_delay(1), Some(Duration::from_millis(200)));
/// assert_eq!(backoff.next_delay(3), None);
/// ```
pub trait BackoffStrategy: Send + Sync {
    /// Calculate the delay before retry number `attempt + 1`.
    ///
    /// `attempt` is the number of retries already performed (0 after the first
    /// failure). Returns `None` once the retry budget is spent.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Maximum number of retries after the initial attempt.
    ///
    /// The operation runs at most `max_retries() + 1` times.
    fn max_retries(&self) -> u32;

    /// Decide whether `error` is worth another attempt.
    ///
    /// The default defers to the error's own classification.
    fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        let _ = attempt;
        error.is_transient()
    }
}
