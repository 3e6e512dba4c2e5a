//! Phase action collaborators.
//!
//! An [`ActionProducer`] decides what to send in a phase. Per-phase
//! overrides in a [`PhaseOverrides`] table take precedence over the
//! producer. [`PhaseLifecycle`] receives start/end notifications.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, LazyLock};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use regex::Regex;
use serde_json::Value;

use crate::error::HandlerError;
use crate::state::StateSnapshot;

// ============================================================================
// Traits
// ============================================================================

/// Produces at most one outbound payload for a phase.
///
/// May be called repeatedly for the same phase while it is continuous, and
/// must treat the snapshot as read-only.
#[async_trait::async_trait]
pub trait ActionProducer: Send + Sync {
    /// Returns the payload to send, or `None` to stay silent.
    async fn handle_phase(
        &self,
        phase: i64,
        state: &StateSnapshot,
    ) -> Result<Option<Value>, HandlerError>;
}

/// Phase start/end notifications. Both default to no-ops.
#[async_trait::async_trait]
pub trait PhaseLifecycle: Send + Sync {
    /// Called after the current phase is set to `phase`.
    async fn on_phase_start(&self, _phase: i64) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Called when `phase` is being left.
    async fn on_phase_end(&self, _phase: i64) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Lifecycle that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLifecycle;

impl PhaseLifecycle for NoopLifecycle {}

/// Returns `true` for payloads that should not be sent:
/// `null`, `{}`, `[]` and `""`.
#[must_use]
pub fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

// ============================================================================
// Override table
// ============================================================================

type OverrideFn = dyn Fn(i64, StateSnapshot) -> BoxFuture<'static, Result<Option<Value>, HandlerError>>
    + Send
    + Sync;

/// Per-phase handlers that replace the producer for their phase.
#[derive(Clone, Default)]
pub struct PhaseOverrides {
    handlers: HashMap<i64, Arc<OverrideFn>>,
}

impl fmt::Debug for PhaseOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut phases: Vec<_> = self.handlers.keys().copied().collect();
        phases.sort_unstable();
        f.debug_struct("PhaseOverrides")
            .field("phases", &phases)
            .finish()
    }
}

impl PhaseOverrides {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler` for `phase`, replacing any earlier one.
    #[must_use]
    pub fn with<F, Fut>(mut self, phase: i64, handler: F) -> Self
    where
        F: Fn(i64, StateSnapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static,
    {
        self.handlers
            .insert(phase, Arc::new(move |p, s| handler(p, s).boxed()));
        self
    }

    /// Returns `true` if `phase` has an override.
    #[must_use]
    pub fn contains(&self, phase: i64) -> bool {
        self.handlers.contains_key(&phase)
    }

    /// Runs the override for `phase`, if there is one.
    pub(crate) fn call(
        &self,
        phase: i64,
        state: &StateSnapshot,
    ) -> Option<BoxFuture<'static, Result<Option<Value>, HandlerError>>> {
        self.handlers.get(&phase).map(|h| h(phase, state.clone()))
    }
}

// ============================================================================
// Scripted producer
// ============================================================================

/// Matches `{{phase}}` and `{{namespace.field}}` placeholders.
static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*(phase|(?:meta|private|public)\.[A-Za-z0-9_]+)\s*\}\}")
        .expect("valid regex")
});

/// Producer that sends a fixed payload template per phase.
///
/// String values may contain placeholders filled from the snapshot. A
/// string that is exactly one placeholder takes the referenced value with
/// its JSON type; otherwise placeholders are spliced in as text, and
/// missing values become `null` or the empty string respectively.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProducer {
    templates: HashMap<i64, Value>,
}

impl ScriptedProducer {
    /// Creates a producer from a phase → template table.
    #[must_use]
    pub const fn new(templates: HashMap<i64, Value>) -> Self {
        Self { templates }
    }

    /// Phases this producer has a template for.
    pub fn phases(&self) -> impl Iterator<Item = i64> + '_ {
        self.templates.keys().copied()
    }

    /// Renders `template` against `state`.
    #[must_use]
    pub fn render(template: &Value, phase: i64, state: &StateSnapshot) -> Value {
        match template {
            Value::String(s) => render_string(s, phase, state),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| Self::render(v, phase, state))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::render(v, phase, state)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn resolve(path: &str, phase: i64, state: &StateSnapshot) -> Option<Value> {
    if path == "phase" {
        return Some(Value::from(phase));
    }
    state.lookup(path).cloned()
}

fn render_string(s: &str, phase: i64, state: &StateSnapshot) -> Value {
    if let Some(caps) = PLACEHOLDER_RE.captures(s) {
        if caps.get(0).is_some_and(|m| m.as_str() == s) {
            return resolve(&caps[1], phase, state).unwrap_or(Value::Null);
        }
    }
    let rendered = PLACEHOLDER_RE.replace_all(s, |caps: &regex::Captures| {
        match resolve(&caps[1], phase, state) {
            Some(Value::String(text)) => text,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    });
    Value::String(rendered.into_owned())
}

#[async_trait::async_trait]
impl ActionProducer for ScriptedProducer {
    async fn handle_phase(
        &self,
        phase: i64,
        state: &StateSnapshot,
    ) -> Result<Option<Value>, HandlerError> {
        Ok(self
            .templates
            .get(&phase)
            .map(|template| Self::render(template, phase, state)))
    }
}
