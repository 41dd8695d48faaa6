//! Fixed-window rate limiting.
//!
//! Windows are aligned to the limiter's creation instant: window `n` covers
//! `[created + n * window, created + (n + 1) * window)`. Each window admits at
//! most `limit` calls; everything else is rejected immediately with the time
//! left until the window rolls over.

use super::{Middleware, Next};
use crate::observability;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use turboguard_core::serde_ext::duration_ms;
use turboguard_core::{Error, Request, Response, Result};

/// Default middleware name.
pub const DEFAULT_NAME: &str = "rate-limit";

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Registration name, also reported in `RateLimited` failures.
    pub name: String,
    /// Calls admitted per window.
    pub limit: u32,
    /// Window length.
    #[serde(rename = "window_ms", with = "duration_ms")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            limit: 60,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Create a config admitting `limit` calls per `window`.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            ..Default::default()
        }
    }

    /// Set the registration name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Reject zero limits and zero-length windows.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(Error::configuration(format!(
                "rate limiter '{}': limit must be at least 1",
                self.name
            )));
        }
        if self.window.is_zero() {
            return Err(Error::configuration(format!(
                "rate limiter '{}': window must be non-zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// Counters exposed by [`RateLimitMiddleware::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    /// Calls admitted since creation
    pub admitted: u64,
    /// Calls rejected since creation
    pub rejected: u64,
    /// Calls admitted in the current window
    pub current_window_count: u32,
}

#[derive(Debug)]
struct WindowState {
    index: u64,
    count: u32,
}

/// Sheds calls beyond a fixed budget per time window.
#[derive(Debug)]
pub struct RateLimitMiddleware {
    config: RateLimitConfig,
    epoch: Instant,
    window: Mutex<WindowState>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimitMiddleware {
    /// Create a limiter whose first window starts now.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            epoch: Instant::now(),
            window: Mutex::new(WindowState { index: 0, count: 0 }),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// The limiter's configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Snapshot of admission counters.
    pub fn stats(&self) -> RateLimitStats {
        let (index, _) = self.window_position(Instant::now());
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        RateLimitStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            current_window_count: if window.index == index { window.count } else { 0 },
        }
    }

    /// Window index for `now` and the time left until it ends.
    fn window_position(&self, now: Instant) -> (u64, Duration) {
        let window_nanos = self.config.window.as_nanos().max(1);
        let elapsed = now.saturating_duration_since(self.epoch).as_nanos();
        let index = elapsed / window_nanos;
        let remaining = window_nanos - elapsed % window_nanos;
        (
            u64::try_from(index).unwrap_or(u64::MAX),
            Duration::from_nanos(u64::try_from(remaining).unwrap_or(u64::MAX)),
        )
    }

    /// Admit one call, or return the time until the next window.
    fn try_acquire(&self) -> std::result::Result<(), Duration> {
        let (index, remaining) = self.window_position(Instant::now());
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if window.index != index {
            window.index = index;
            window.count = 0;
        }
        if window.count < self.config.limit {
            window.count += 1;
            self.admitted.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            Err(remaining)
        }
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn handle(&self, request: &mut Request, next: Next<'_>) -> Result<Response> {
        if let Err(retry_after) = self.try_acquire() {
            observability::log_rate_limited(&self.config.name, request, retry_after);
            return Err(Error::RateLimited {
                limiter: self.config.name.clone(),
                retry_after,
            });
        }
        next.run(request).await
    }
}
