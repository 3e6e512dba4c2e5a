//! `validate` command.

use crate::cli::args::{OutputFormat, ValidateArgs};
use crate::config::ConfigLoader;
use crate::error::{AgentsError, ConfigError, Severity, ValidationIssue};

/// Loads and validates a configuration file, printing the findings.
///
/// # Errors
///
/// Returns the load error, or a validation error if `--strict` is set and
/// there are warnings.
pub fn run(args: &ValidateArgs) -> Result<(), AgentsError> {
    let load = match ConfigLoader::default().load(&args.config) {
        Ok(load) => load,
        Err(e) => {
            if args.format == OutputFormat::Json {
                print_json(args, false, &issues_of(&e), &[]);
            } else {
                super::report_config_error(&e);
            }
            return Err(e.into());
        }
    };

    let warnings: Vec<ValidationIssue> = load
        .warnings
        .iter()
        .map(|w| ValidationIssue {
            path: w.location.clone().unwrap_or_default(),
            message: w.message.clone(),
            severity: Severity::Warning,
        })
        .collect();
    let failed = args.strict && !warnings.is_empty();

    match args.format {
        OutputFormat::Human => {
            for warning in &warnings {
                eprintln!("  {warning}");
            }
            if !failed {
                println!(
                    "{}: valid ({} agents, {} warnings)",
                    args.config.display(),
                    load.config.agents.len(),
                    warnings.len()
                );
            }
        }
        OutputFormat::Json => print_json(args, !failed, &[], &warnings),
    }

    if failed {
        return Err(ConfigError::ValidationError {
            path: args.config.display().to_string(),
            errors: warnings,
        }
        .into());
    }
    Ok(())
}

fn issues_of(err: &ConfigError) -> Vec<ValidationIssue> {
    match err {
        ConfigError::ValidationError { errors, .. } => errors.clone(),
        other => vec![ValidationIssue {
            path: String::new(),
            message: other.to_string(),
            severity: Severity::Error,
        }],
    }
}

fn print_json(
    args: &ValidateArgs,
    valid: bool,
    errors: &[ValidationIssue],
    warnings: &[ValidationIssue],
) {
    let render = |issues: &[ValidationIssue]| -> Vec<serde_json::Value> {
        issues
            .iter()
            .map(|i| serde_json::json!({"path": i.path, "message": i.message}))
            .collect()
    };
    let report = serde_json::json!({
        "file": args.config.display().to_string(),
        "valid": valid,
        "errors": render(errors),
        "warnings": render(warnings),
    });
    println!("{report}");
}
