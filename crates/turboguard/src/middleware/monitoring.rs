//! Per-target call metrics.
//!
//! The monitoring middleware is observational: it times the downstream call,
//! folds the outcome into an aggregate keyed by [`Request::target`] and hands
//! the result back untouched.

use super::{Middleware, Next};
use crate::observability::{self, CallTimer};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use turboguard_core::{Error, ErrorKind, Request, Response, Result, keys};

/// Default middleware name.
pub const DEFAULT_NAME: &str = "monitoring";

/// The most recent failure seen for a target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastError {
    /// Rendered error message
    pub message: String,
    /// Error kind
    pub kind: ErrorKind,
    /// Wall-clock time the failure was recorded
    pub at: DateTime<Utc>,
}

/// Aggregated metrics for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSnapshot {
    /// Calls recorded
    pub total: u64,
    /// Calls that returned a response
    pub successes: u64,
    /// Calls that returned an error
    pub failures: u64,
    /// `failures / total`, 0 when no calls were recorded
    pub error_rate: f64,
    /// Mean latency
    #[serde(rename = "avg_latency_ms", serialize_with = "serialize_millis")]
    pub avg_latency: Duration,
    /// Fastest call
    #[serde(rename = "min_latency_ms", serialize_with = "serialize_millis")]
    pub min_latency: Duration,
    /// Slowest call
    #[serde(rename = "max_latency_ms", serialize_with = "serialize_millis")]
    pub max_latency: Duration,
    /// Most recent failure, if any
    pub last_error: Option<LastError>,
}

/// Metrics for every target seen since creation or the last reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitoringSnapshot {
    /// Per-target aggregates, ordered by target name
    pub targets: BTreeMap<String, TargetSnapshot>,
}

impl MonitoringSnapshot {
    /// Aggregate for one target.
    pub fn target(&self, target: &str) -> Option<&TargetSnapshot> {
        self.targets.get(target)
    }

    /// Calls recorded across all targets.
    pub fn total_calls(&self) -> u64 {
        self.targets.values().map(|t| t.total).sum()
    }
}

fn serialize_millis<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1_000.0)
}

#[derive(Debug, Default)]
struct TargetRecord {
    total: u64,
    successes: u64,
    failures: u64,
    latency_sum: Duration,
    latency_min: Option<Duration>,
    latency_max: Duration,
    last_error: Option<LastError>,
}

impl TargetRecord {
    fn record(&mut self, latency: Duration, error: Option<&Error>) {
        self.total += 1;
        self.latency_sum += latency;
        self.latency_min = Some(self.latency_min.map_or(latency, |min| min.min(latency)));
        self.latency_max = self.latency_max.max(latency);
        match error {
            None => self.successes += 1,
            Some(error) => {
                self.failures += 1;
                self.last_error = Some(LastError {
                    message: error.to_string(),
                    kind: error.kind(),
                    at: Utc::now(),
                });
            }
        }
    }

    fn snapshot(&self) -> TargetSnapshot {
        let (error_rate, avg_latency) = if self.total == 0 {
            (0.0, Duration::ZERO)
        } else {
            // Precision loss past 2^53 calls is irrelevant for a ratio
            let total = self.total as f64;
            (
                self.failures as f64 / total,
                self.latency_sum.div_f64(total),
            )
        };
        TargetSnapshot {
            total: self.total,
            successes: self.successes,
            failures: self.failures,
            error_rate,
            avg_latency,
            min_latency: self.latency_min.unwrap_or_default(),
            max_latency: self.latency_max,
            last_error: self.last_error.clone(),
        }
    }
}

type TargetMap = HashMap<String, Arc<Mutex<TargetRecord>>>;

/// Records latency and outcome of every call, per target.
#[derive(Debug)]
pub struct MonitoringMiddleware {
    name: String,
    targets: RwLock<TargetMap>,
}

impl Default for MonitoringMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitoringMiddleware {
    /// Create an empty monitor.
    pub fn new() -> Self {
        Self::with_name(DEFAULT_NAME)
    }

    /// Create an empty monitor registered under `name`.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Metrics for every target.
    pub fn snapshot(&self) -> MonitoringSnapshot {
        let records: Vec<(String, Arc<Mutex<TargetRecord>>)> = self
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(target, record)| (target.clone(), Arc::clone(record)))
            .collect();

        MonitoringSnapshot {
            targets: records
                .into_iter()
                .map(|(target, record)| {
                    let snapshot = record.lock().unwrap_or_else(PoisonError::into_inner).snapshot();
                    (target, snapshot)
                })
                .collect(),
        }
    }

    /// Metrics for a single target, if it has been seen.
    pub fn target_snapshot(&self, target: &str) -> Option<TargetSnapshot> {
        let record = self
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .cloned()?;
        let snapshot = record.lock().unwrap_or_else(PoisonError::into_inner).snapshot();
        Some(snapshot)
    }

    /// Discard all aggregates.
    pub fn reset(&self) {
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn record_for(&self, target: &str) -> Arc<Mutex<TargetRecord>> {
        if let Some(record) = self
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
        {
            return Arc::clone(record);
        }
        let mut targets = self.targets.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(targets.entry(target.to_string()).or_default())
    }

    fn observe(&self, request: &Request, latency: Duration, error: Option<&Error>) {
        let record = self.record_for(request.target());
        record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(latency, error);
    }
}

#[async_trait]
impl Middleware for MonitoringMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, request: &mut Request, next: Next<'_>) -> Result<Response> {
        let timer = CallTimer::start();
        let result = next.run(request).await;
        let latency = timer.elapsed();

        let error = result.as_ref().err();
        self.observe(request, latency, error);
        request.metadata_mut().insert(
            keys::LATENCY_MS,
            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
        );
        observability::log_call_observed(request, latency, error);
        result
    }
}
