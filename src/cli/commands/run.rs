//! `run` command.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::args::RunArgs;
use crate::config::loader::resolve_relative;
use crate::config::{AgentConfig, ConfigLoader, RunConfig, load_game_spec};
use crate::error::{AgentsError, ConfigError, SessionError};
use crate::observability::events::EventEmitter;
use crate::runner::GameRunner;

/// Loads the configuration and runs every agent until the game ends or
/// `cancel` fires.
///
/// # Errors
///
/// Returns a config error for an invalid configuration or game spec, an
/// I/O error if the events file or metrics endpoint cannot be set up, and
/// [`SessionError::AgentsFailed`] if any session failed.
pub async fn run(args: &RunArgs, cancel: CancellationToken) -> Result<(), AgentsError> {
    if let Some(port) = args.metrics_port {
        crate::observability::init_metrics(Some(port))?;
        info!(port, "Prometheus metrics endpoint started");
    }

    let load = ConfigLoader::default().load(&args.config).inspect_err(|e| {
        super::report_config_error(e);
    })?;
    super::log_warnings(&load.warnings);
    let config = load.config;

    let agents = resolve_agents(args, &config)?;
    info!(agents = agents.len(), url = %config.server.url, "starting game run");

    let emitter = event_sink(args.events_file.as_deref())?;
    let total = agents.len();
    let runner = GameRunner::new(config, agents)
        .with_emitter(Arc::new(emitter))
        .with_shutdown(cancel.child_token());

    let summary = runner.run().await;
    for (id, outcome) in &summary.outcomes {
        info!(agent_id = id, outcome = %outcome, "agent finished");
    }
    if summary.all_ok() {
        Ok(())
    } else {
        Err(SessionError::AgentsFailed {
            failed: summary.failed(),
            total,
        }
        .into())
    }
}

/// Opens the lifecycle event sink: none, stdout for `-`, or a file.
fn event_sink(path: Option<&Path>) -> std::io::Result<EventEmitter> {
    match path {
        None => Ok(EventEmitter::noop()),
        Some(path) if path == Path::new("-") => Ok(EventEmitter::stdout()),
        Some(path) => EventEmitter::from_file(path),
    }
}

/// Agents come from the game spec when one is given, else from the config.
fn resolve_agents(args: &RunArgs, config: &RunConfig) -> Result<Vec<AgentConfig>, AgentsError> {
    let spec_path = args.game_spec.clone().or_else(|| {
        config
            .game_spec
            .as_deref()
            .map(|p| resolve_relative(&args.config, p))
    });

    let Some(path) = spec_path else {
        return Ok(config.agents.clone());
    };
    let spec = load_game_spec(&path)?;
    if !config.agents.is_empty() {
        warn!(
            path = %path.display(),
            "game spec given; agents listed in the configuration are ignored"
        );
    }
    let agents = spec.agents();
    if agents.is_empty() {
        return Err(ConfigError::MissingRequired {
            field: "recovery_codes".to_string(),
            location: path.display().to_string(),
        }
        .into());
    }
    info!(game_id = spec.game_id, agents = agents.len(), "loaded game spec");
    Ok(agents)
}
