//! Request and response values that flow through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Well-known metadata keys written by the built-in middleware.
pub mod keys {
    /// Number of retries performed for the call (0 when the first attempt won).
    pub const RETRY_ATTEMPTS: &str = "retry.attempts";
    /// Circuit state observed when the breaker admitted the call.
    pub const CIRCUIT_STATE: &str = "circuit.state";
    /// Latency of the call as observed by the monitoring middleware, in ms.
    pub const LATENCY_MS: &str = "monitoring.latency_ms";
}

/// Mutable key/value bag used to pass signals between middlewares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(HashMap<String, Value>);

impl Metadata {
    /// Create an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Look up a value as an unsigned integer.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    /// Look up a value as a string slice.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Whether the bag holds `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// An outbound call to an AI provider.
///
/// Identity fields (`id`, `target`, `created_at`) are fixed at construction;
/// middlewares receive `&mut Request` but can only change [`Metadata`].
///
/// # Examples
///
/// ```rust
/// use turboguard_core::Request;
/// use serde_json::json;
/// use std::time::Duration;
///
/// let request = Request::new("claude-sonnet", json!({"prompt": "hello"}))
///     .with_timeout(Duration::from_secs(30))
///     .with_metadata("tenant", "acme");
///
/// assert_eq!(request.target(), "claude-sonnet");
/// assert!(request.deadline().is_some());
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    id: Uuid,
    target: String,
    created_at: DateTime<Utc>,
    payload: Value,
    metadata: Metadata,
    deadline: Option<Instant>,
    cancellation: Option<CancellationToken>,
}

impl Request {
    /// Create a request for a logical target (usually a model name).
    pub fn new(target: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            created_at: Utc::now(),
            payload,
            metadata: Metadata::new(),
            deadline: None,
            cancellation: None,
        }
    }

    /// Set an absolute deadline for the whole call, retries included.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Attach a cancellation token owned by the caller.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Seed a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Stable request identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Logical target name.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Wall-clock creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Opaque provider payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Metadata bag.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable metadata bag.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Absolute deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `Some(ZERO)` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Cancellation token, if any.
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Whether the caller has cancelled this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// The complete result of a provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    target: String,
    payload: Value,
}

impl Response {
    /// Create a response produced for `target`.
    pub fn new(target: impl Into<String>, payload: Value) -> Self {
        Self {
            target: target.into(),
            payload,
        }
    }

    /// Create a response for the target of `request`.
    pub fn for_request(request: &Request, payload: Value) -> Self {
        Self::new(request.target(), payload)
    }

    /// Target that produced the response.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Response payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Consume the response, returning the payload.
    pub fn into_payload(self) -> Value {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_identity() {
        let a = Request::new("gpt-embed", json!({"input": "x"}));
        let b = Request::new("gpt-embed", json!({"input": "x"}));

        assert_ne!(a.id(), b.id());
        assert_eq!(a.target(), "gpt-embed");
        assert_eq!(a.payload()["input"], "x");

        // Clones keep the identity
        let c = a.clone();
        assert_eq!(a.id(), c.id());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let mut request = Request::new("m", json!(null)).with_metadata("tenant", "acme");
        request.metadata_mut().insert(keys::RETRY_ATTEMPTS, 2u64);

        assert_eq!(request.metadata().get_str("tenant"), Some("acme"));
        assert_eq!(request.metadata().get_u64(keys::RETRY_ATTEMPTS), Some(2));
        assert_eq!(request.metadata().len(), 2);

        request.metadata_mut().remove("tenant");
        assert!(!request.metadata().contains_key("tenant"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_remaining() {
        let request = Request::new("m", json!(null)).with_timeout(Duration::from_secs(2));
        assert_eq!(request.remaining(), Some(Duration::from_secs(2)));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(request.remaining(), Some(Duration::ZERO));

        assert_eq!(Request::new("m", json!(null)).remaining(), None);
    }

    #[test]
    fn test_cancellation_flag() {
        let token = CancellationToken::new();
        let request = Request::new("m", json!(null)).with_cancellation(token.clone());

        assert!(!request.is_cancelled());
        token.cancel();
        assert!(request.is_cancelled());
    }

    #[test]
    fn test_response_for_request() {
        let request = Request::new("dall-e", json!({}));
        let response = Response::for_request(&request, json!({"url": "https://img"}));

        assert_eq!(response.target(), "dall-e");
        assert_eq!(response.into_payload()["url"], "https://img");
    }
}
