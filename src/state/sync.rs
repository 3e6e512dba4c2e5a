//! Event-driven state synchronization.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::dispatch::Event;
use crate::error::HandlerError;

use super::mapping::FieldMapping;
use super::snapshot::StateSnapshot;

/// Custom update routine that replaces declarative mapping for one event type.
///
/// Receives the event type, the event data and the snapshot to mutate.
pub type CustomHandler =
    Arc<dyn Fn(&str, &Map<String, Value>, &mut StateSnapshot) -> Result<(), HandlerError> + Send + Sync>;

/// Owns a session's [`StateSnapshot`] and applies events to it.
///
/// The snapshot sits behind a lock so the continuous-phase task can read it
/// while the receive loop is between events; only [`update`](Self::update)
/// ever writes.
pub struct StateSynchronizer {
    snapshot: RwLock<StateSnapshot>,
    mappings: Vec<FieldMapping>,
    custom: HashMap<String, CustomHandler>,
}

impl fmt::Debug for StateSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSynchronizer")
            .field("mappings", &self.mappings.len())
            .field("custom_handlers", &self.custom.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl StateSynchronizer {
    /// Creates a synchronizer over `initial` with the given mapping table.
    #[must_use]
    pub fn new(initial: StateSnapshot, mappings: Vec<FieldMapping>) -> Self {
        Self {
            snapshot: RwLock::new(initial),
            mappings,
            custom: HashMap::new(),
        }
    }

    /// Registers a custom handler for `event_type`, replacing any earlier one.
    #[must_use]
    pub fn with_custom_handler<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str, &Map<String, Value>, &mut StateSnapshot) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.custom.insert(event_type.into(), Arc::new(handler));
        self
    }

    /// Appends a mapping after the declared ones.
    pub fn push_mapping(&mut self, mapping: FieldMapping) {
        self.mappings.push(mapping);
    }

    /// The mapping table in application order.
    #[must_use]
    pub fn mappings(&self) -> &[FieldMapping] {
        &self.mappings
    }

    /// Returns a copy of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current phase as recorded in the snapshot.
    #[must_use]
    pub fn current_phase(&self) -> i64 {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current_phase()
    }

    /// Applies `event` to the snapshot and returns the number of fields written.
    ///
    /// A custom handler for the event type takes over completely. Otherwise
    /// every mapping whose filters admit the event and whose source key is
    /// present is applied, in declaration order. Values rejected by a field's
    /// kind are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns the custom handler's error, if it fails.
    pub fn update(&self, event: &Event) -> Result<usize, HandlerError> {
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(handler) = self.custom.get(&event.event_type) {
            debug!(event_type = %event.event_type, "custom state handler");
            handler(&event.event_type, &event.data, &mut *snapshot)?;
            return Ok(0);
        }

        let mut written = 0;
        for mapping in &self.mappings {
            // Phase is re-read per mapping so an earlier mapping in this same
            // event can move it.
            if !mapping.applies(&event.event_type, snapshot.current_phase()) {
                continue;
            }
            let Some(value) = event.data.get(mapping.source_key()) else {
                continue;
            };
            if let Err(e) = mapping.check(value) {
                warn!(event_type = %event.event_type, error = %e, "rejected state value");
                continue;
            }
            snapshot.set(mapping.namespace(), mapping.target_field(), value.clone());
            written += 1;
        }
        Ok(written)
    }
}
