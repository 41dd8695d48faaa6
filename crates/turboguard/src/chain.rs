//! Priority-ordered middleware registry.
//!
//! ```rust
//! use std::sync::Arc;
//! use turboguard::{MiddlewareChain, MonitoringMiddleware, Request, Response, handler_fn};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let monitor = Arc::new(MonitoringMiddleware::new());
//! let chain = MiddlewareChain::new().with(monitor.clone(), 10);
//!
//! let terminal = handler_fn(|request| async move {
//!     Ok(Response::for_request(&request, json!({"text": "hello"})))
//! });
//! let mut request = Request::new("claude-sonnet", json!({"prompt": "hi"}));
//! let response = chain.execute(&mut request, &terminal).await.unwrap();
//!
//! assert_eq!(response.payload()["text"], "hello");
//! assert_eq!(monitor.snapshot().total_calls(), 1);
//! # });
//! ```

use crate::middleware::{Handler, Middleware, Next};
use crate::observability;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use turboguard_core::{Request, Response, Result};

/// How priorities map to nesting depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityOrder {
    /// Lower priority numbers run first and wrap everything after them.
    #[default]
    Ascending,
    /// Higher priority numbers run first.
    Descending,
}

struct Registration {
    middleware: Arc<dyn Middleware>,
    priority: i32,
    enabled: bool,
    sequence: u64,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Registration>,
    next_sequence: u64,
}

/// An ordered, runtime-adjustable set of middlewares.
///
/// Administration (`add`, `remove`, `enable`, `disable`) may run while calls
/// are in flight. Each call works on the set of enabled middlewares captured
/// when it started.
pub struct MiddlewareChain {
    ordering: PriorityOrder,
    registry: RwLock<Registry>,
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("ordering", &self.ordering)
            .field("middlewares", &self.registered_names())
            .finish()
    }
}

impl MiddlewareChain {
    /// Create an empty chain with ascending priority order.
    pub fn new() -> Self {
        Self::with_ordering(PriorityOrder::Ascending)
    }

    /// Create an empty chain with the given priority order.
    pub fn with_ordering(ordering: PriorityOrder) -> Self {
        Self {
            ordering,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// The chain's priority order.
    pub fn ordering(&self) -> PriorityOrder {
        self.ordering
    }

    /// Register a middleware at `priority`.
    ///
    /// Equal priorities keep insertion order. Names are not required to be
    /// unique; lookups by name act on the first match in execution order.
    pub fn add<M: Middleware + 'static>(&self, middleware: M, priority: i32) {
        self.add_arc(Arc::new(middleware), priority);
    }

    /// Register a shared middleware, keeping a handle for introspection.
    pub fn add_arc(&self, middleware: Arc<dyn Middleware>, priority: i32) {
        let name = middleware.name().to_string();
        {
            let mut registry = self.write();
            let sequence = registry.next_sequence;
            registry.next_sequence += 1;
            registry.entries.push(Registration {
                middleware,
                priority,
                enabled: true,
                sequence,
            });
            let ordering = self.ordering;
            registry.entries.sort_by(|a, b| {
                let by_priority = match ordering {
                    PriorityOrder::Ascending => a.priority.cmp(&b.priority),
                    PriorityOrder::Descending => b.priority.cmp(&a.priority),
                };
                by_priority.then(a.sequence.cmp(&b.sequence))
            });
        }
        observability::log_chain_change("add", &name, Some(priority));
    }

    /// Builder-style [`add_arc`](Self::add_arc).
    pub fn with(self, middleware: Arc<dyn Middleware>, priority: i32) -> Self {
        self.add_arc(middleware, priority);
        self
    }

    /// Remove every registration named `name`.
    ///
    /// Returns `false` if nothing was registered under that name.
    pub fn remove(&self, name: &str) -> bool {
        let removed = {
            let mut registry = self.write();
            let before = registry.entries.len();
            registry.entries.retain(|r| r.middleware.name() != name);
            registry.entries.len() != before
        };
        if removed {
            observability::log_chain_change("remove", name, None);
        }
        removed
    }

    /// Re-enable a disabled middleware in place.
    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    /// Skip a middleware without losing its position.
    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    /// Whether `name` is enabled, or `None` if it is not registered.
    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.read()
            .entries
            .iter()
            .find(|r| r.middleware.name() == name)
            .map(|r| r.enabled)
    }

    /// Names in execution order, outermost first, including disabled ones.
    pub fn registered_names(&self) -> Vec<String> {
        self.read()
            .entries
            .iter()
            .map(|r| r.middleware.name().to_string())
            .collect()
    }

    /// Number of registrations, enabled or not.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Run `request` through every enabled middleware and then `terminal`.
    ///
    /// Errors from middlewares and the terminal propagate unchanged.
    pub async fn execute<H>(&self, request: &mut Request, terminal: &H) -> Result<Response>
    where
        H: Handler + ?Sized,
    {
        let snapshot = self.snapshot();
        let terminal = Terminal(terminal);
        Next::new(&snapshot, &terminal).run(request).await
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let found = {
            let mut registry = self.write();
            match registry
                .entries
                .iter_mut()
                .find(|r| r.middleware.name() == name)
            {
                Some(registration) => {
                    registration.enabled = enabled;
                    true
                }
                None => false,
            }
        };
        if found {
            let action = if enabled { "enable" } else { "disable" };
            observability::log_chain_change(action, name, None);
        }
        found
    }

    fn snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.read()
            .entries
            .iter()
            .filter(|r| r.enabled)
            .map(|r| Arc::clone(&r.middleware))
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Adapts a possibly unsized handler reference to `&dyn Handler`.
struct Terminal<'a, H: ?Sized>(&'a H);

#[async_trait::async_trait]
impl<'a, H: Handler + ?Sized> Handler for Terminal<'a, H> {
    async fn call(&self, request: &Request) -> Result<Response> {
        self.0.call(request).await
    }
}
