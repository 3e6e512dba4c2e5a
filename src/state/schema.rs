//! Declarative state field definitions.
//!
//! A [`StateSchema`] lists the fields of each namespace. It yields both the
//! initial [`StateSnapshot`] (every field at its default) and the
//! [`FieldMapping`] table the synchronizer applies to incoming events.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StateError;

use super::mapping::{FieldKind, FieldMapping};
use super::snapshot::{Namespace, StateSnapshot};

/// One declared state field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSpec {
    /// Field name inside its namespace.
    pub name: String,

    /// Initial value.
    #[serde(default)]
    pub default: Value,

    /// Optional kind constraint on mapped values.
    #[serde(default)]
    pub kind: Option<FieldKind>,

    /// Event payload key to read; defaults to `name`.
    #[serde(default)]
    pub event_key: Option<String>,

    /// Only update on these event types.
    #[serde(default)]
    pub events: Option<Vec<String>>,

    /// Never update on these event types.
    #[serde(default)]
    pub exclude_events: Option<Vec<String>>,

    /// Only update during these phases.
    #[serde(default)]
    pub phases: Option<Vec<i64>>,

    /// Never update during these phases.
    #[serde(default)]
    pub exclude_phases: Option<Vec<i64>>,

    /// Field is never written by declarative mapping.
    #[serde(default)]
    pub exclude_from_mapping: bool,
}

impl FieldSpec {
    /// Creates a field with a `null` default and no filters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: Value::Null,
            kind: None,
            event_key: None,
            events: None,
            exclude_events: None,
            phases: None,
            exclude_phases: None,
            exclude_from_mapping: false,
        }
    }

    /// Payload key this field reads from.
    #[must_use]
    pub fn source_key(&self) -> &str {
        self.event_key.as_deref().unwrap_or(&self.name)
    }

    /// Compiles this field into a mapping, or `None` if it is excluded.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ConflictingFilter`] when both allow and deny
    /// lists are set for events or phases.
    pub fn to_mapping(&self, namespace: Namespace) -> Result<Option<FieldMapping>, StateError> {
        if self.exclude_from_mapping {
            return Ok(None);
        }
        let mut builder = FieldMapping::builder(self.source_key(), namespace, &self.name);
        if let Some(events) = &self.events {
            builder = builder.events(events.iter().cloned());
        }
        if let Some(events) = &self.exclude_events {
            builder = builder.exclude_events(events.iter().cloned());
        }
        if let Some(phases) = &self.phases {
            builder = builder.phases(phases.iter().copied());
        }
        if let Some(phases) = &self.exclude_phases {
            builder = builder.exclude_phases(phases.iter().copied());
        }
        if let Some(kind) = self.kind {
            builder = builder.kind(kind);
        }
        builder.build().map(Some)
    }
}

/// Field declarations for all three namespaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateSchema {
    /// Bookkeeping fields.
    #[serde(default)]
    pub meta: Vec<FieldSpec>,
    /// Participant-private fields.
    #[serde(default)]
    pub private: Vec<FieldSpec>,
    /// Shared fields.
    #[serde(default)]
    pub public: Vec<FieldSpec>,
}

impl StateSchema {
    /// Fields declared for `ns`.
    #[must_use]
    pub fn fields(&self, ns: Namespace) -> &[FieldSpec] {
        match ns {
            Namespace::Meta => &self.meta,
            Namespace::Private => &self.private,
            Namespace::Public => &self.public,
        }
    }

    /// Iterates `(namespace, field)` in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (Namespace, &FieldSpec)> {
        Namespace::ALL
            .into_iter()
            .flat_map(move |ns| self.fields(ns).iter().map(move |f| (ns, f)))
    }

    /// Returns `true` if some field writes `namespace.name`.
    #[must_use]
    pub fn declares(&self, ns: Namespace, name: &str) -> bool {
        self.fields(ns).iter().any(|f| f.name == name)
    }

    /// Builds the snapshot with every field at its default value.
    #[must_use]
    pub fn initial_snapshot(&self) -> StateSnapshot {
        let mut snapshot = StateSnapshot::new();
        for (ns, field) in self.iter() {
            snapshot.set(ns, field.name.clone(), field.default.clone());
        }
        snapshot
    }

    /// Compiles all non-excluded fields into mappings, in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::DuplicateField`] if a name repeats within a
    /// namespace, or [`StateError::ConflictingFilter`] for contradictory filters.
    pub fn mappings(&self) -> Result<Vec<FieldMapping>, StateError> {
        let mut seen = HashSet::new();
        let mut mappings = Vec::new();
        for (ns, field) in self.iter() {
            if !seen.insert((ns, field.name.as_str())) {
                return Err(StateError::DuplicateField {
                    field: field.name.clone(),
                    namespace: ns.to_string(),
                });
            }
            if let Some(mapping) = field.to_mapping(ns)? {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }
}
