//! Circuit breaker middleware.
//!
//! # States
//!
//! ```text
//!            failure rate >= threshold
//!            (after minimum_calls)
//!   [Closed] ----------------------------> [Open]
//!      ^                                    |  ^
//!      | permitted_calls_in_half_open       |  | any probe failure
//!      | probe successes                    |  |
//!      |                                    v  |
//!      +------------------------------- [Half-Open]
//!                     open_duration elapsed (checked on the next call)
//! ```
//!
//! Half-open uses a fail-fast policy: the first failed probe reopens the
//! circuit, and the circuit closes only once every permitted probe has
//! succeeded. Calls beyond the probe quota are rejected while probes are in
//! flight.
//!
//! All state lives in one mutex per breaker. The downstream call runs outside
//! the lock; its outcome is recorded against the generation it was admitted
//! in, so outcomes that straddle a transition are discarded.

use super::{Middleware, Next};
use crate::observability;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use turboguard_core::serde_ext::duration_ms;
use turboguard_core::{Error, ErrorKind, Request, Response, Result, keys};

/// Default middleware name.
pub const DEFAULT_NAME: &str = "circuit-breaker";

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without invoking downstream.
    Open,
    /// A bounded number of probe calls are let through.
    HalfOpen,
}

impl CircuitState {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Registration name, also reported in `CircuitOpen` failures.
    pub name: String,
    /// Failure ratio in `(0, 1]` at which a closed circuit opens.
    pub failure_rate_threshold: f64,
    /// Outcomes required before the failure rate is evaluated.
    pub minimum_calls: u32,
    /// How long an open circuit rejects calls before probing.
    #[serde(rename = "open_duration_ms", with = "duration_ms")]
    pub open_duration: Duration,
    /// Probe calls admitted while half-open.
    pub permitted_calls_in_half_open: u32,
    /// Failure kinds that count neither as success nor as failure.
    pub ignored_kinds: HashSet<ErrorKind>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            failure_rate_threshold: 0.5,
            minimum_calls: 10,
            open_duration: Duration::from_secs(30),
            permitted_calls_in_half_open: 3,
            ignored_kinds: HashSet::from([ErrorKind::Cancelled]),
        }
    }
}

impl CircuitBreakerConfig {
    /// Check thresholds for values the state machine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 1.0) {
            return Err(Error::configuration(format!(
                "circuit breaker '{}': failure_rate_threshold must be in (0, 1], got {}",
                self.name, self.failure_rate_threshold
            )));
        }
        if self.minimum_calls == 0 {
            return Err(Error::configuration(format!(
                "circuit breaker '{}': minimum_calls must be at least 1",
                self.name
            )));
        }
        if self.permitted_calls_in_half_open == 0 {
            return Err(Error::configuration(format!(
                "circuit breaker '{}': permitted_calls_in_half_open must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker, for exporters and health checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Current state
    pub state: CircuitState,
    /// Successes since the last transition
    pub successes: u64,
    /// Failures since the last transition
    pub failures: u64,
    /// `failures / (successes + failures)`, 0 when nothing was recorded
    pub failure_rate: f64,
    /// Probes admitted in the current half-open period
    pub probes_in_flight: u32,
    /// Calls rejected since creation
    pub rejected_calls: u64,
    /// State transitions since creation
    pub transitions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Ignored,
}

#[derive(Debug, Clone, Copy)]
struct Permit {
    generation: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    successes: u64,
    failures: u64,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    probes_issued: u32,
    probe_successes: u32,
    generation: u64,
    rejected: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            successes: 0,
            failures: 0,
            opened_at: None,
            last_failure_at: None,
            probes_issued: 0,
            probe_successes: 0,
            generation: 0,
            rejected: 0,
        }
    }

    /// Outcomes counted since the last transition.
    fn total(&self) -> u64 {
        self.successes.saturating_add(self.failures)
    }

    fn failure_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.failures as f64 / total as f64,
        }
    }

    /// Move to `to`, resetting every per-state counter.
    fn transition(&mut self, to: CircuitState, now: Instant, name: &str) {
        let from = self.state;
        self.state = to;
        self.successes = 0;
        self.failures = 0;
        self.probes_issued = 0;
        self.probe_successes = 0;
        self.generation += 1;
        self.opened_at = (to == CircuitState::Open).then_some(now);
        observability::log_circuit_transition(name, from, to);
    }
}

/// Fails fast once a dependency's failure rate crosses a threshold, and
/// probes for recovery after a cooldown.
#[derive(Debug)]
pub struct CircuitBreakerMiddleware {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreakerMiddleware {
    /// Create a breaker in the closed state.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(BreakerState::new()),
        })
    }

    /// The breaker's configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state.
    ///
    /// An open circuit whose cooldown has elapsed still reports `Open` until
    /// the next call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Snapshot of counters.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.lock();
        CircuitBreakerMetrics {
            state: state.state,
            successes: state.successes,
            failures: state.failures,
            failure_rate: state.failure_rate(),
            probes_in_flight: state.probes_issued.saturating_sub(state.probe_successes),
            rejected_calls: state.rejected,
            transitions: state.generation,
        }
    }

    /// Time since the last counted failure, if any.
    pub fn since_last_failure(&self) -> Option<Duration> {
        self.lock().last_failure_at.map(|at| at.elapsed())
    }

    /// Force the breaker closed, discarding in-flight outcomes.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.transition(CircuitState::Closed, Instant::now(), &self.config.name);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // Critical sections never panic midway, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether the current call may proceed.
    fn acquire(&self, request: &Request) -> Result<(Permit, CircuitState)> {
        let mut state = self.lock();
        let now = Instant::now();

        if state.state == CircuitState::Open {
            let opened_at = state.opened_at.unwrap_or(now);
            let elapsed = now.saturating_duration_since(opened_at);
            if elapsed < self.config.open_duration {
                state.rejected += 1;
                let retry_in = self.config.open_duration - elapsed;
                drop(state);
                observability::log_circuit_rejected(&self.config.name, request, retry_in);
                return Err(self.open_error(retry_in));
            }
            state.transition(CircuitState::HalfOpen, now, &self.config.name);
        }

        if state.state == CircuitState::HalfOpen {
            if state.probes_issued >= self.config.permitted_calls_in_half_open {
                state.rejected += 1;
                drop(state);
                observability::log_circuit_rejected(&self.config.name, request, Duration::ZERO);
                return Err(self.open_error(Duration::ZERO));
            }
            state.probes_issued += 1;
        }

        Ok((
            Permit {
                generation: state.generation,
            },
            state.state,
        ))
    }

    /// Fold one outcome into the state machine.
    fn record(&self, permit: Permit, outcome: Outcome) {
        let mut state = self.lock();
        if permit.generation != state.generation {
            return;
        }
        let now = Instant::now();
        if outcome == Outcome::Failure {
            state.last_failure_at = Some(now);
        }

        match state.state {
            CircuitState::Closed => {
                match outcome {
                    Outcome::Success => state.successes = state.successes.saturating_add(1),
                    Outcome::Failure => state.failures = state.failures.saturating_add(1),
                    Outcome::Ignored => return,
                }
                if state.total() >= u64::from(self.config.minimum_calls)
                    && state.failure_rate() >= self.config.failure_rate_threshold
                {
                    state.transition(CircuitState::Open, now, &self.config.name);
                }
            }
            CircuitState::HalfOpen => match outcome {
                Outcome::Failure => {
                    state.failures = state.failures.saturating_add(1);
                    state.transition(CircuitState::Open, now, &self.config.name);
                }
                Outcome::Success => {
                    state.successes = state.successes.saturating_add(1);
                    state.probe_successes += 1;
                    if state.probe_successes >= self.config.permitted_calls_in_half_open {
                        state.transition(CircuitState::Closed, now, &self.config.name);
                    }
                }
                Outcome::Ignored => {
                    state.probes_issued = state.probes_issued.saturating_sub(1);
                }
            },
            // A permit is never issued in this state within the same generation
            CircuitState::Open => {}
        }
    }

    fn classify(&self, result: &Result<Response>) -> Outcome {
        match result {
            Ok(_) => Outcome::Success,
            Err(error) if self.config.ignored_kinds.contains(&error.kind()) => Outcome::Ignored,
            Err(_) => Outcome::Failure,
        }
    }

    fn open_error(&self, retry_in: Duration) -> Error {
        Error::CircuitOpen {
            breaker: self.config.name.clone(),
            retry_in,
        }
    }
}

/// Records `Ignored` if the call is dropped before completing, so an abandoned
/// probe does not hold its half-open slot forever.
struct PermitGuard<'a> {
    breaker: &'a CircuitBreakerMiddleware,
    permit: Option<Permit>,
}

impl PermitGuard<'_> {
    fn complete(mut self, outcome: Outcome) {
        if let Some(permit) = self.permit.take() {
            self.breaker.record(permit, outcome);
        }
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.record(permit, Outcome::Ignored);
        }
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn handle(&self, request: &mut Request, next: Next<'_>) -> Result<Response> {
        let (permit, admitted_in) = self.acquire(request)?;
        request
            .metadata_mut()
            .insert(keys::CIRCUIT_STATE, admitted_in.as_str());

        let guard = PermitGuard {
            breaker: self,
            permit: Some(permit),
        };
        let result = next.run(request).await;
        guard.complete(self.classify(&result));
        result
    }
}
