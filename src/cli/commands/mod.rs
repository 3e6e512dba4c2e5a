//! CLI command dispatch.

pub mod run;
pub mod validate;
pub mod version;

use tokio_util::sync::CancellationToken;

use crate::cli::args::{Cli, Commands};
use crate::config::LoadWarning;
use crate::error::{AgentsError, ConfigError};

/// Runs the parsed command. `cancel` is triggered on Ctrl+C or SIGTERM.
///
/// # Errors
///
/// Returns the command's error; the caller maps it to an exit code.
pub async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<(), AgentsError> {
    match cli.command {
        Commands::Run(args) => run::run(&args, cancel).await,
        Commands::Validate(args) => validate::run(&args),
        Commands::Version(args) => {
            version::run(&args);
            Ok(())
        }
    }
}

/// Logs load warnings.
fn log_warnings(warnings: &[LoadWarning]) {
    for warning in warnings {
        tracing::warn!(
            location = warning.location.as_deref().unwrap_or("<unknown>"),
            "{}",
            warning.message
        );
    }
}

/// Prints every validation issue carried by `err` to stderr.
fn report_config_error(err: &ConfigError) {
    if let ConfigError::ValidationError { errors, .. } = err {
        for issue in errors {
            eprintln!("  {issue}");
        }
    }
}
