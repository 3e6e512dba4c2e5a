//! Phase machine configuration.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PhaseError;

/// Default event type announcing a phase change.
pub const DEFAULT_TRANSITION_EVENT: &str = "phase-transition";

/// Default key holding the new phase inside the transition event's data.
pub const DEFAULT_PHASE_KEY: &str = "phase";

const fn default_min_delay() -> u64 {
    5
}

const fn default_max_delay() -> u64 {
    10
}

fn default_transition_event() -> String {
    DEFAULT_TRANSITION_EVENT.to_string()
}

fn default_phase_key() -> String {
    DEFAULT_PHASE_KEY.to_string()
}

/// Immutable per-session phase settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseConfig {
    /// Event type that carries phase transitions.
    #[serde(default = "default_transition_event")]
    pub transition_event: String,

    /// Key in the transition event's data holding the new phase.
    #[serde(default = "default_phase_key")]
    pub phase_key: String,

    /// Phases that repeat actions at randomized intervals.
    #[serde(default)]
    pub continuous: HashSet<i64>,

    /// Lower bound of the delay between continuous actions, in seconds.
    #[serde(default = "default_min_delay")]
    pub min_delay_secs: u64,

    /// Upper bound of the delay between continuous actions, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            transition_event: default_transition_event(),
            phase_key: default_phase_key(),
            continuous: HashSet::new(),
            min_delay_secs: default_min_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

impl PhaseConfig {
    /// Checks the delay bounds.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::InvalidDelayRange`] when min exceeds max.
    pub const fn validate(&self) -> Result<(), PhaseError> {
        if self.min_delay_secs > self.max_delay_secs {
            return Err(PhaseError::InvalidDelayRange {
                min: self.min_delay_secs,
                max: self.max_delay_secs,
            });
        }
        Ok(())
    }

    /// Returns `true` if `phase` is continuous.
    #[must_use]
    pub fn is_continuous(&self, phase: i64) -> bool {
        self.continuous.contains(&phase)
    }

    /// Draws a whole-second delay uniformly from `[min, max]`.
    #[must_use]
    pub fn random_delay(&self) -> Duration {
        let (lo, hi) = if self.min_delay_secs <= self.max_delay_secs {
            (self.min_delay_secs, self.max_delay_secs)
        } else {
            (self.max_delay_secs, self.min_delay_secs)
        };
        Duration::from_secs(rand::rng().random_range(lo..=hi))
    }

    /// Extracts the new phase from a transition event's data.
    ///
    /// Integers and integer strings yield `Some`; a missing key or `null`
    /// yields `None` ("no active phase").
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::InvalidPhaseValue`] for any other value.
    pub fn parse_phase(&self, value: Option<&Value>) -> Result<Option<i64>, PhaseError> {
        let invalid = |v: &Value| PhaseError::InvalidPhaseValue {
            key: self.phase_key.clone(),
            value: v.to_string(),
        };
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(v @ Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| invalid(v)),
            Some(v @ Value::String(s)) => s.trim().parse().map(Some).map_err(|_| invalid(v)),
            Some(v) => Err(invalid(v)),
        }
    }
}
