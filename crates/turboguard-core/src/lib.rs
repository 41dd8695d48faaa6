#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Core value types for the TurboGuard resilience pipeline.
//!
//! This crate holds everything the middleware crate and provider adapters
//! share without depending on each other:
//!
//! - **Failure taxonomy** via [`Error`] and [`ErrorKind`]
//! - **Call values** via [`Request`], [`Response`] and [`Metadata`]
//! - **Backoff schedules** via the [`retry::BackoffStrategy`] trait
//!   - Exponential backoff with jitter
//! - **Serde helpers** for millisecond durations in configuration files
//!
//! # Examples
//!
//! Using the prelude for convenient imports:
//!
//! ```rust
//! use turboguard_core::prelude::*;
//! use serde_json::json;
//!
//! let request = Request::new("claude-haiku", json!({"prompt": "ping"}));
//! let failure = Error::provider_status(503, "upstream unavailable");
//!
//! assert_eq!(failure.kind(), ErrorKind::Provider);
//! assert!(failure.is_transient());
//! assert_eq!(request.target(), "claude-haiku");
//! ```

pub mod error;
pub mod request;
pub mod retry;
pub mod serde_ext;

pub use error::{Error, ErrorKind, Result};
pub use request::{Metadata, Request, Response, keys};

/// Convenient re-exports of commonly used items.
///
/// ```rust
/// use turboguard_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::request::{Metadata, Request, Response};
    pub use crate::retry::{BackoffStrategy, ExponentialBackoff, ExponentialBackoffBuilder};
}
