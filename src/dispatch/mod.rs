//! Event dispatch pipeline.
//!
//! [`EventDispatcher`] routes each [`Event`] through six ordered stages:
//!
//! 1. global pre-hooks
//! 2. type-specific pre-hooks
//! 3. global handlers
//! 4. type-specific handlers
//! 5. type-specific post-hooks
//! 6. global post-hooks
//!
//! Callables run strictly one after another. A callable that returns an
//! error or panics is logged and skipped; the rest of the pipeline still runs.

pub mod event;

pub use event::{EVENT_MESSAGE_TYPE, Event};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::HandlerError;
use crate::observability::metrics;

// ============================================================================
// Callbacks
// ============================================================================

type SyncFn = dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync;
type AsyncFn = dyn Fn(Arc<Event>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync;

#[derive(Clone)]
enum CallbackKind {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

/// A registered hook or handler.
///
/// Cloning a `Callback` shares the underlying function, so a clone can later
/// be passed to an `unregister_*` method to remove exactly that entry.
#[derive(Clone)]
pub struct Callback {
    kind: CallbackKind,
}

impl Callback {
    /// Wraps an asynchronous callable.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self {
            kind: CallbackKind::Async(Arc::new(move |event| f(event).boxed())),
        }
    }

    /// Wraps a synchronous callable.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self {
            kind: CallbackKind::Sync(Arc::new(f)),
        }
    }

    /// Returns `true` if both values refer to the same registered callable.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (CallbackKind::Sync(a), CallbackKind::Sync(b)) => Arc::ptr_eq(a, b),
            (CallbackKind::Async(a), CallbackKind::Async(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Invokes the callable, converting a panic into a [`HandlerError`].
    async fn invoke(&self, event: &Arc<Event>) -> Result<(), HandlerError> {
        match &self.kind {
            CallbackKind::Sync(f) => std::panic::catch_unwind(AssertUnwindSafe(|| f(event)))
                .unwrap_or_else(|panic| Err(panic_to_error(&*panic))),
            CallbackKind::Async(f) => isolate(f(Arc::clone(event))).await,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            CallbackKind::Sync(_) => "sync",
            CallbackKind::Async(_) => "async",
        };
        f.debug_struct("Callback").field("kind", &kind).finish()
    }
}

/// Awaits `fut`, converting a panic inside it into a [`HandlerError`].
pub(crate) async fn isolate<T, F>(fut: F) -> Result<T, HandlerError>
where
    F: Future<Output = Result<T, HandlerError>>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(panic_to_error(&*panic)))
}

fn panic_to_error(panic: &(dyn std::any::Any + Send)) -> HandlerError {
    let message = panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    HandlerError::Failed(format!("callable panicked: {message}"))
}

// ============================================================================
// Registry
// ============================================================================

/// The kind of callable a registration targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Runs before handlers.
    PreHook,
    /// Primary response to an event.
    Handler,
    /// Runs after handlers.
    PostHook,
}

impl Stage {
    const fn label(self, global: bool) -> &'static str {
        match (self, global) {
            (Self::PreHook, true) => "global_pre_hook",
            (Self::PreHook, false) => "pre_hook",
            (Self::Handler, true) => "global_handler",
            (Self::Handler, false) => "handler",
            (Self::PostHook, true) => "global_post_hook",
            (Self::PostHook, false) => "post_hook",
        }
    }
}

#[derive(Default)]
struct Registry {
    global: HashMap<Stage, Vec<Callback>>,
    specific: HashMap<(Stage, String), Vec<Callback>>,
}

impl Registry {
    fn list_mut(&mut self, stage: Stage, event_type: Option<&str>) -> &mut Vec<Callback> {
        match event_type {
            None => self.global.entry(stage).or_default(),
            Some(t) => self.specific.entry((stage, t.to_string())).or_default(),
        }
    }

    fn snapshot(&self, stage: Stage, event_type: Option<&str>) -> Vec<Callback> {
        let list = match event_type {
            None => self.global.get(&stage),
            Some(t) => self.specific.get(&(stage, t.to_string())),
        };
        list.cloned().unwrap_or_default()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Ordered hook/handler pipeline for inbound events.
///
/// Registration takes `&self` so the dispatcher can be shared behind an
/// `Arc` and extended while a session is running; lists are snapshotted at
/// the start of each dispatch.
#[derive(Default)]
pub struct EventDispatcher {
    registry: RwLock<Registry>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let global: usize = registry.global.values().map(Vec::len).sum();
        let specific: usize = registry.specific.values().map(Vec::len).sum();
        f.debug_struct("EventDispatcher")
            .field("global_callables", &global)
            .field("specific_callables", &specific)
            .finish()
    }
}

impl EventDispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `callback` to the list for `stage`.
    ///
    /// `event_type = None` registers in the global scope.
    pub fn register(&self, stage: Stage, event_type: Option<&str>, callback: Callback) -> &Self {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .list_mut(stage, event_type)
            .push(callback);
        self
    }

    /// Removes `callback` (by identity) from the list for `stage`, or clears
    /// the whole list when `callback` is `None`.
    pub fn unregister(
        &self,
        stage: Stage,
        event_type: Option<&str>,
        callback: Option<&Callback>,
    ) -> &Self {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let list = registry.list_mut(stage, event_type);
        match callback {
            Some(target) => list.retain(|c| !c.ptr_eq(target)),
            None => list.clear(),
        }
        self
    }

    /// Registers a handler for one event type.
    pub fn register_handler(&self, event_type: &str, callback: Callback) -> &Self {
        self.register(Stage::Handler, Some(event_type), callback)
    }

    /// Registers a handler for every event type.
    pub fn register_global_handler(&self, callback: Callback) -> &Self {
        self.register(Stage::Handler, None, callback)
    }

    /// Registers a pre-hook for one event type.
    pub fn register_pre_hook(&self, event_type: &str, callback: Callback) -> &Self {
        self.register(Stage::PreHook, Some(event_type), callback)
    }

    /// Registers a pre-hook for every event type.
    pub fn register_global_pre_hook(&self, callback: Callback) -> &Self {
        self.register(Stage::PreHook, None, callback)
    }

    /// Registers a post-hook for one event type.
    pub fn register_post_hook(&self, event_type: &str, callback: Callback) -> &Self {
        self.register(Stage::PostHook, Some(event_type), callback)
    }

    /// Registers a post-hook for every event type.
    pub fn register_global_post_hook(&self, callback: Callback) -> &Self {
        self.register(Stage::PostHook, None, callback)
    }

    /// Unregisters one handler, or all handlers for `event_type`.
    pub fn unregister_handler(&self, event_type: &str, callback: Option<&Callback>) -> &Self {
        self.unregister(Stage::Handler, Some(event_type), callback)
    }

    /// Unregisters one global handler, or all of them.
    pub fn unregister_global_handler(&self, callback: Option<&Callback>) -> &Self {
        self.unregister(Stage::Handler, None, callback)
    }

    /// Unregisters one pre-hook, or all pre-hooks for `event_type`.
    pub fn unregister_pre_hook(&self, event_type: &str, callback: Option<&Callback>) -> &Self {
        self.unregister(Stage::PreHook, Some(event_type), callback)
    }

    /// Unregisters one global pre-hook, or all of them.
    pub fn unregister_global_pre_hook(&self, callback: Option<&Callback>) -> &Self {
        self.unregister(Stage::PreHook, None, callback)
    }

    /// Unregisters one post-hook, or all post-hooks for `event_type`.
    pub fn unregister_post_hook(&self, event_type: &str, callback: Option<&Callback>) -> &Self {
        self.unregister(Stage::PostHook, Some(event_type), callback)
    }

    /// Unregisters one global post-hook, or all of them.
    pub fn unregister_global_post_hook(&self, callback: Option<&Callback>) -> &Self {
        self.unregister(Stage::PostHook, None, callback)
    }

    /// Runs `event` through the full pipeline.
    ///
    /// Never fails: each callable's error is logged and the pipeline moves on.
    pub async fn on(&self, event: Event) {
        let event = Arc::new(event);
        let event_type = event.event_type.as_str();

        let stages = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            [
                (Stage::PreHook, true),
                (Stage::PreHook, false),
                (Stage::Handler, true),
                (Stage::Handler, false),
                (Stage::PostHook, false),
                (Stage::PostHook, true),
            ]
            .map(|(stage, global)| {
                let scope = if global { None } else { Some(event_type) };
                (stage.label(global), registry.snapshot(stage, scope))
            })
        };

        for (label, callbacks) in stages {
            for callback in callbacks {
                if let Err(e) = callback.invoke(&event).await {
                    warn!(
                        stage = label,
                        event_type = %event.event_type,
                        error = %e,
                        "callable failed"
                    );
                    metrics::record_callable_failure(label);
                }
            }
        }
        debug!(event_type = %event.event_type, "event dispatched");
    }
}

// ============================================================================
// Tests
// ============================================================================
