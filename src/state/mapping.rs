//! Declarative event-to-state field mappings.

use std::borrow::Borrow;
use std::collections::HashSet;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StateError;

use super::snapshot::Namespace;

// ============================================================================
// Filters
// ============================================================================

/// Condition on a value (an event type or a phase).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Filter<T: Eq + Hash> {
    /// Always applies.
    #[default]
    Any,
    /// Applies iff the value is in the set.
    Allow(HashSet<T>),
    /// Applies iff the value is not in the set.
    Deny(HashSet<T>),
}

impl<T: Eq + Hash> Filter<T> {
    /// Builds a filter from optional allow/deny lists.
    ///
    /// Returns `None` when both lists are given.
    pub fn from_lists<A, D>(allow: Option<A>, deny: Option<D>) -> Option<Self>
    where
        A: IntoIterator<Item = T>,
        D: IntoIterator<Item = T>,
    {
        match (allow, deny) {
            (Some(_), Some(_)) => None,
            (Some(a), None) => Some(Self::Allow(a.into_iter().collect())),
            (None, Some(d)) => Some(Self::Deny(d.into_iter().collect())),
            (None, None) => Some(Self::Any),
        }
    }

    /// Returns `true` if the filter admits `value`.
    pub fn admits<Q>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        match self {
            Self::Any => true,
            Self::Allow(set) => set.contains(value),
            Self::Deny(set) => !set.contains(value),
        }
    }
}

// ============================================================================
// Value kinds
// ============================================================================

/// JSON kind a field's values must have.
///
/// `null` is accepted for every kind so fields can be cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// JSON string
    String,
    /// JSON integer
    Integer,
    /// Any JSON number
    Number,
    /// JSON boolean
    Boolean,
    /// JSON array
    Array,
    /// JSON object
    Object,
    /// Phase number: an integer or a string holding one
    Phase,
    /// No constraint
    Any,
}

impl FieldKind {
    /// Returns `true` if `value` conforms to this kind.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any, _)
            | (_, Value::Null)
            | (Self::String, Value::String(_))
            | (Self::Number, Value::Number(_))
            | (Self::Boolean, Value::Bool(_))
            | (Self::Array, Value::Array(_))
            | (Self::Object, Value::Object(_)) => true,
            (Self::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Phase, Value::Number(n)) => n.is_i64(),
            (Self::Phase, Value::String(s)) => s.trim().parse::<i64>().is_ok(),
            _ => false,
        }
    }

    /// Describes the JSON kind of `value` for error messages.
    #[must_use]
    pub const fn describe(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

// ============================================================================
// FieldMapping
// ============================================================================

/// Rule translating one event payload key into one state field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    source_key: String,
    namespace: Namespace,
    target_field: String,
    phase_filter: Filter<i64>,
    event_filter: Filter<String>,
    kind: Option<FieldKind>,
}

impl FieldMapping {
    /// Creates an unfiltered mapping `source_key -> namespace.target_field`.
    pub fn new(
        source_key: impl Into<String>,
        namespace: Namespace,
        target_field: impl Into<String>,
    ) -> Self {
        Self {
            source_key: source_key.into(),
            namespace,
            target_field: target_field.into(),
            phase_filter: Filter::Any,
            event_filter: Filter::Any,
            kind: None,
        }
    }

    /// Starts building a mapping with filters.
    pub fn builder(
        source_key: impl Into<String>,
        namespace: Namespace,
        target_field: impl Into<String>,
    ) -> FieldMappingBuilder {
        FieldMappingBuilder {
            mapping: Self::new(source_key, namespace, target_field),
            events: None,
            exclude_events: None,
            phases: None,
            exclude_phases: None,
        }
    }

    /// Payload key read from event data.
    #[must_use]
    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    /// Namespace written to.
    #[must_use]
    pub const fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Field written to.
    #[must_use]
    pub fn target_field(&self) -> &str {
        &self.target_field
    }

    /// Phase condition.
    #[must_use]
    pub const fn phase_filter(&self) -> &Filter<i64> {
        &self.phase_filter
    }

    /// Event type condition.
    #[must_use]
    pub const fn event_filter(&self) -> &Filter<String> {
        &self.event_filter
    }

    /// Declared kind, if any.
    #[must_use]
    pub const fn kind(&self) -> Option<FieldKind> {
        self.kind
    }

    /// Returns `true` if this mapping applies to `event_type` in `phase`.
    #[must_use]
    pub fn applies(&self, event_type: &str, phase: i64) -> bool {
        self.phase_filter.admits(&phase) && self.event_filter.admits(event_type)
    }

    /// Checks `value` against the declared kind.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::TypeMismatch`] when the value has the wrong kind.
    pub fn check(&self, value: &Value) -> Result<(), StateError> {
        match self.kind {
            Some(kind) if !kind.accepts(value) => Err(StateError::TypeMismatch {
                field: format!("{}.{}", self.namespace, self.target_field),
                expected: format!("{kind:?}").to_lowercase(),
                actual: FieldKind::describe(value).to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Builder for [`FieldMapping`] that rejects contradictory filters.
#[derive(Debug, Clone)]
pub struct FieldMappingBuilder {
    mapping: FieldMapping,
    events: Option<Vec<String>>,
    exclude_events: Option<Vec<String>>,
    phases: Option<Vec<i64>>,
    exclude_phases: Option<Vec<i64>>,
}

impl FieldMappingBuilder {
    /// Only apply for these event types.
    #[must_use]
    pub fn events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = Some(events.into_iter().map(Into::into).collect());
        self
    }

    /// Never apply for these event types.
    #[must_use]
    pub fn exclude_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_events = Some(events.into_iter().map(Into::into).collect());
        self
    }

    /// Only apply during these phases.
    #[must_use]
    pub fn phases(mut self, phases: impl IntoIterator<Item = i64>) -> Self {
        self.phases = Some(phases.into_iter().collect());
        self
    }

    /// Never apply during these phases.
    #[must_use]
    pub fn exclude_phases(mut self, phases: impl IntoIterator<Item = i64>) -> Self {
        self.exclude_phases = Some(phases.into_iter().collect());
        self
    }

    /// Requires mapped values to have this kind.
    #[must_use]
    pub fn kind(mut self, kind: FieldKind) -> Self {
        self.mapping.kind = Some(kind);
        self
    }

    /// Finishes the mapping.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ConflictingFilter`] if either filter was given
    /// both an allow-list and a deny-list.
    pub fn build(self) -> Result<FieldMapping, StateError> {
        let Self {
            mut mapping,
            events,
            exclude_events,
            phases,
            exclude_phases,
        } = self;
        mapping.event_filter =
            Filter::from_lists(events, exclude_events).ok_or_else(|| {
                StateError::ConflictingFilter {
                    field: mapping.target_field.clone(),
                    filter: "event",
                }
            })?;
        mapping.phase_filter =
            Filter::from_lists(phases, exclude_phases).ok_or_else(|| {
                StateError::ConflictingFilter {
                    field: mapping.target_field.clone(),
                    filter: "phase",
                }
            })?;
        Ok(mapping)
    }
}
