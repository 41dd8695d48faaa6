//! Backoff strategies for retrying failed provider calls.
//!
//! # Key Types
//!
//! - [`BackoffStrategy`] - Core trait for retry schedules
//! - [`ExponentialBackoff`] - Exponential backoff with optional jitter
//!
//! # Examples
//!
//! ```rust
//! use turboguard_core::retry::{BackoffStrategy, ExponentialBackoff};
//! use std::time::Duration;
//!
//! let backoff = ExponentialBackoff::builder()
//!     .max_retries(3)
//!     .initial_interval(Duration::from_millis(100))
//!     .try_build()
//!     .expect("valid backoff");
//!
//! assert_eq!(backoff.max_retries(), 3);
//! ```

mod exponential;
mod strategy;

pub use exponential::{ExponentialBackoff, ExponentialBackoffBuilder};
pub use strategy::BackoffStrategy;
