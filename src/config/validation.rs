//! Configuration validation.
//!
//! Runs on the deserialized [`RunConfig`] and collects every issue instead
//! of stopping at the first one.

use std::collections::HashSet;

use crate::config::loader::ConfigLimits;
use crate::config::schema::RunConfig;
use crate::error::{Severity, ValidationIssue};
use crate::state::{FieldSpec, Namespace};

/// Outcome of validating a configuration.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Issues that prevent the configuration from being used.
    pub errors: Vec<ValidationIssue>,

    /// Informational issues.
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Returns `true` if there are any errors.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Configuration validator.
#[derive(Debug, Default)]
pub struct Validator {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
}

impl Validator {
    /// Creates a validator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `config` against `limits`.
    pub fn validate(&mut self, config: &RunConfig, limits: &ConfigLimits) -> ValidationResult {
        self.errors.clear();
        self.warnings.clear();

        self.validate_server(config);
        self.validate_phases(config);
        self.validate_state(config);
        self.validate_actions(config);
        self.validate_agents(config, limits);

        ValidationResult {
            errors: std::mem::take(&mut self.errors),
            warnings: std::mem::take(&mut self.warnings),
        }
    }

    fn validate_server(&mut self, config: &RunConfig) {
        let url = config.server.url.trim();
        if url.is_empty() {
            self.add_error("server.url", "server URL is required");
        } else if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            self.add_error("server.url", "server URL must start with ws:// or wss://");
        }
    }

    fn validate_phases(&mut self, config: &RunConfig) {
        let phases = &config.phases;
        if phases.min_delay_secs > phases.max_delay_secs {
            self.add_error(
                "phases.min_delay_secs",
                &format!(
                    "min_delay_secs ({}) exceeds max_delay_secs ({})",
                    phases.min_delay_secs, phases.max_delay_secs
                ),
            );
        }
        if phases.max_delay_secs == 0 && !phases.continuous.is_empty() {
            self.add_warning(
                "phases.max_delay_secs",
                "max_delay_secs is 0; continuous phases will act back-to-back",
            );
        }
        if phases.transition_event.is_empty() {
            self.add_error("phases.transition_event", "transition event type cannot be empty");
        }
        if phases.phase_key.is_empty() {
            self.add_error("phases.phase_key", "phase key cannot be empty");
        }

        let mut continuous: Vec<_> = phases.continuous.iter().copied().collect();
        continuous.sort_unstable();
        for phase in continuous {
            if !config.has_action(phase) {
                self.add_warning(
                    "phases.continuous",
                    &format!("continuous phase {phase} has no configured action"),
                );
            }
        }
    }

    fn validate_state(&mut self, config: &RunConfig) {
        for ns in Namespace::ALL {
            let mut seen = HashSet::new();
            for (i, field) in config.state.fields(ns).iter().enumerate() {
                let path = format!("state.{ns}[{i}]");
                if field.name.is_empty() {
                    self.add_error(&path, "field name cannot be empty");
                } else if !seen.insert(field.name.as_str()) {
                    self.add_error(&path, &format!("duplicate field '{}' in {ns}", field.name));
                }
                self.validate_field_filters(field, &path);
            }
        }
    }

    fn validate_field_filters(&mut self, field: &FieldSpec, path: &str) {
        if field.events.is_some() && field.exclude_events.is_some() {
            self.add_error(
                &format!("{path}.events"),
                &format!("field '{}' sets both events and exclude_events", field.name),
            );
        }
        if field.phases.is_some() && field.exclude_phases.is_some() {
            self.add_error(
                &format!("{path}.phases"),
                &format!("field '{}' sets both phases and exclude_phases", field.name),
            );
        }
        if field.exclude_from_mapping && field.event_key.is_some() {
            self.add_warning(
                &format!("{path}.event_key"),
                &format!("field '{}' is excluded from mapping; event_key is unused", field.name),
            );
        }
    }

    fn validate_actions(&mut self, config: &RunConfig) {
        for key in config.actions.keys() {
            if key.phase().is_none() {
                self.add_error(
                    &format!("actions.{key}"),
                    "action keys must be integer phase numbers",
                );
            }
        }
    }

    fn validate_agents(&mut self, config: &RunConfig, limits: &ConfigLimits) {
        if config.agents.is_empty() && config.game_spec.is_none() {
            self.add_error("agents", "at least one agent or a game_spec is required");
        }
        if config.agents.len() > limits.max_agents {
            self.add_error(
                "agents",
                &format!(
                    "too many agents ({} > {})",
                    config.agents.len(),
                    limits.max_agents
                ),
            );
        }
        let mut ids = HashSet::new();
        for (i, agent) in config.agents.iter().enumerate() {
            if !ids.insert(agent.id) {
                self.add_error(
                    &format!("agents[{i}].id"),
                    &format!("duplicate agent id {}", agent.id),
                );
            }
            if agent.credentials.is_null() {
                self.add_warning(
                    &format!("agents[{i}].credentials"),
                    "credentials are null; the login frame will be `null`",
                );
            }
        }
    }

    fn add_error(&mut self, path: &str, message: &str) {
        self.errors.push(ValidationIssue {
            path: path.to_string(),
            message: message.to_string(),
            severity: Severity::Error,
        });
    }

    fn add_warning(&mut self, path: &str, message: &str) {
        self.warnings.push(ValidationIssue {
            path: path.to_string(),
            message: message.to_string(),
            severity: Severity::Warning,
        });
    }
}
