//! Common test utilities and helpers

use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use turboguard::{Error, Handler, Request, Response, Result, async_trait};

/// One scripted outcome of a [`ScriptedProvider`] call.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum Step {
    /// Respond after the given latency
    Ok(Duration),
    /// Fail with a provider status after the given latency
    Fail(u16, Duration),
}

/// Provider stand-in that replays a script, then keeps succeeding.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
}

#[allow(dead_code)]
impl ScriptedProvider {
    /// Create a provider replaying `steps` in order
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into_iter().collect()),
            calls: AtomicU32::new(0),
        })
    }

    /// Create a provider that fails `failures` times with 503, then succeeds
    pub fn flaky(failures: usize) -> Arc<Self> {
        Self::new(std::iter::repeat_n(Step::Fail(503, Duration::ZERO), failures))
    }

    /// Create a provider that always fails with `status`
    pub fn broken(status: u16) -> Arc<Self> {
        Self::new(std::iter::repeat_n(Step::Fail(status, Duration::ZERO), 10_000))
    }

    /// Number of times the provider was invoked
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Append steps to the script
    pub fn push(&self, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().unwrap().extend(steps);
    }

    /// Drop the remaining script so every call succeeds
    pub fn heal(&self) {
        self.script.lock().unwrap().clear();
    }
}

#[async_trait]
impl Handler for ScriptedProvider {
    async fn call(&self, request: &Request) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Ok(Duration::ZERO));

        match step {
            Step::Ok(latency) => {
                tokio::time::sleep(latency).await;
                Ok(Response::for_request(request, json!({"text": "ok"})))
            }
            Step::Fail(status, latency) => {
                tokio::time::sleep(latency).await;
                Err(Error::provider_status(status, format!("provider returned {status}")))
            }
        }
    }
}

/// Install a test-writer subscriber once; honors `RUST_LOG`
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A fresh request for `target`
#[allow(dead_code)]
pub fn request(target: &str) -> Request {
    Request::new(target, json!({"prompt": "hello"}))
}
