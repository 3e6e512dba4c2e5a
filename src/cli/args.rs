//! CLI argument definitions.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::observability::LogFormat;

/// Runs scripted participants against an economic experiment server.
#[derive(Parser, Debug)]
#[command(name = "econagents", author, version, about)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all non-error output.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log line format.
    #[arg(long, default_value = "human", global = true, env = "ECONAGENTS_LOG_FORMAT")]
    pub log_format: LogFormatArg,

    /// Color output control.
    #[arg(long, default_value = "auto", global = true, env = "ECONAGENTS_COLOR")]
    pub color: ColorChoice,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect every configured agent and play until the game ends.
    Run(RunArgs),

    /// Validate a configuration file without connecting.
    Validate(ValidateArgs),

    /// Display version information.
    Version(VersionArgs),
}

/// Arguments for `run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the YAML run configuration.
    #[arg(short, long, env = "ECONAGENTS_CONFIG")]
    pub config: PathBuf,

    /// Game spec JSON; overrides `game_spec` in the configuration.
    #[arg(short, long, env = "ECONAGENTS_GAME_SPEC")]
    pub game_spec: Option<PathBuf>,

    /// Write the JSONL lifecycle event stream to this file (`-` for stdout).
    #[arg(long, env = "ECONAGENTS_EVENTS_FILE")]
    pub events_file: Option<PathBuf>,

    /// Serve Prometheus metrics on 127.0.0.1 at this port.
    #[arg(long, env = "ECONAGENTS_METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

/// Arguments for `validate`.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the YAML run configuration.
    #[arg(short, long, env = "ECONAGENTS_CONFIG")]
    pub config: PathBuf,

    /// Treat warnings as errors.
    #[arg(long)]
    pub strict: bool,

    /// Output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,
}

/// Arguments for `version`.
#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,
}

// ============================================================================
// CLI-Local Enums
// ============================================================================

/// Color output choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorChoice {
    /// Auto-detect terminal support.
    #[default]
    Auto,
    /// Always use color.
    Always,
    /// Never use color.
    Never,
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output.
    #[default]
    Human,
    /// JSON output.
    Json,
}

/// Log format flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable lines.
    #[default]
    Human,
    /// One JSON object per line.
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Human => Self::Human,
            LogFormatArg::Json => Self::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "econagents",
            "-vv",
            "run",
            "--config",
            "game.yaml",
            "--metrics-port",
            "9100",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, PathBuf::from("game.yaml"));
                assert_eq!(args.metrics_port, Some(9100));
                assert!(args.game_spec.is_none());
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_validate_strict_json() {
        let cli = Cli::try_parse_from([
            "econagents",
            "validate",
            "-c",
            "game.yaml",
            "--strict",
            "--format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Validate(args) => {
                assert!(args.strict);
                assert_eq!(args.format, OutputFormat::Json);
            }
            other => panic!("expected validate, got {other:?}"),
        }
    }

    #[test]
    fn test_log_format_conversion() {
        assert_eq!(LogFormat::from(LogFormatArg::Json), LogFormat::Json);
        assert_eq!(LogFormat::from(LogFormatArg::default()), LogFormat::Human);
    }
}
