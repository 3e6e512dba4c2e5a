//! Configuration loader.
//!
//! Pipeline:
//! 1. Size check and read, stripping a UTF-8 BOM
//! 2. Environment variable expansion on the raw text
//! 3. YAML parsing into [`RunConfig`]
//! 4. Validation
//! 5. Freeze with `Arc`

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::config::schema::{GameSpec, RunConfig};
use crate::config::validation::Validator;
use crate::error::ConfigError;

/// Limits applied while loading.
#[derive(Debug, Clone)]
pub struct ConfigLimits {
    /// Maximum configuration file size in bytes.
    pub max_config_size: usize,

    /// Maximum number of explicitly configured agents.
    pub max_agents: usize,
}

impl Default for ConfigLimits {
    fn default() -> Self {
        Self {
            max_config_size: env_or("ECONAGENTS_MAX_CONFIG_SIZE", 1024 * 1024),
            max_agents: env_or("ECONAGENTS_MAX_AGENTS", 256),
        }
    }
}

/// A loaded, validated configuration.
#[derive(Debug)]
pub struct LoadResult {
    /// The frozen configuration.
    pub config: Arc<RunConfig>,

    /// Warnings from substitution and validation.
    pub warnings: Vec<LoadWarning>,
}

/// Non-fatal issue found while loading.
#[derive(Debug, Clone)]
pub struct LoadWarning {
    /// Warning message.
    pub message: String,

    /// Where it occurred.
    pub location: Option<String>,
}

/// Loads run configuration files.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    limits: ConfigLimits,
}

impl ConfigLoader {
    /// Creates a loader with the given limits.
    #[must_use]
    pub const fn new(limits: ConfigLimits) -> Self {
        Self { limits }
    }

    /// Loads and validates the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or too large, a required
    /// environment variable is unset, the YAML does not parse into the
    /// schema, or validation reports errors.
    pub fn load(&self, path: &Path) -> Result<LoadResult, ConfigError> {
        let raw = read_limited(path, self.limits.max_config_size)?;
        let raw = raw.strip_prefix('\u{feff}').unwrap_or(&raw);

        let mut env_sub = EnvSubstitution::new();
        let substituted = env_sub.substitute(raw, path)?;
        let mut warnings = env_sub.warnings;

        let root: serde_yaml::Value =
            serde_yaml::from_str(&substituted).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                line: e.location().map(|l| l.line()),
                message: e.to_string(),
            })?;
        if root.is_null() {
            return Err(ConfigError::ParseError {
                path: path.to_path_buf(),
                line: None,
                message: "configuration file is empty".to_string(),
            });
        }

        let config: RunConfig =
            serde_yaml::from_value(root).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                line: e.location().map(|l| l.line()),
                message: format!("failed to deserialize configuration: {e}"),
            })?;

        let result = Validator::new().validate(&config, &self.limits);
        if result.has_errors() {
            return Err(ConfigError::ValidationError {
                path: path.display().to_string(),
                errors: result.errors,
            });
        }
        warnings.extend(result.warnings.into_iter().map(|issue| LoadWarning {
            message: issue.message,
            location: Some(issue.path),
        }));

        Ok(LoadResult {
            config: Arc::new(config),
            warnings,
        })
    }
}

/// Reads a game spec JSON file.
///
/// # Errors
///
/// Returns [`ConfigError::MissingFile`] if it cannot be read and
/// [`ConfigError::ParseError`] if it is not a valid game spec.
pub fn load_game_spec(path: &Path) -> Result<GameSpec, ConfigError> {
    let raw = read_limited(path, ConfigLimits::default().max_config_size)?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        line: Some(e.line()),
        message: e.to_string(),
    })
}

fn read_limited(path: &Path, max_size: usize) -> Result<String, ConfigError> {
    let metadata = std::fs::metadata(path).map_err(|_| ConfigError::MissingFile {
        path: path.to_path_buf(),
    })?;
    let size = usize::try_from(metadata.len()).unwrap_or(usize::MAX);
    if size > max_size {
        return Err(ConfigError::InvalidValue {
            field: "file_size".to_string(),
            value: format!("{size} bytes"),
            expected: format!("at most {max_size} bytes"),
        });
    }
    std::fs::read_to_string(path).map_err(|_| ConfigError::MissingFile {
        path: path.to_path_buf(),
    })
}

// ============================================================================
// Environment Variable Substitution
// ============================================================================

/// `$$`, a closed `${...}` reference on one line, or a dangling `${`.
static ENV_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\$|\$\{([^}\n]*)\}|\$\{").expect("valid regex"));

static VAR_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

/// Pre-parse substitution on raw YAML text, so expanded values still go
/// through YAML type inference.
struct EnvSubstitution {
    warnings: Vec<LoadWarning>,
}

impl EnvSubstitution {
    const fn new() -> Self {
        Self {
            warnings: Vec::new(),
        }
    }

    /// Supports `${VAR}` (empty with a warning if unset), `${VAR:-default}`,
    /// `${VAR:?message}` (error if unset) and `$$` for a literal `$`.
    fn substitute(&mut self, raw: &str, source: &Path) -> Result<String, ConfigError> {
        let mut out = String::with_capacity(raw.len());
        let mut last = 0;

        for caps in ENV_REF_RE.captures_iter(raw) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            out.push_str(&raw[last..whole.start()]);
            last = whole.end();
            let line = raw[..whole.start()].matches('\n').count() + 1;

            match (whole.as_str(), caps.get(1)) {
                ("$$", _) => out.push('$'),
                (_, Some(spec)) => {
                    let value = self.resolve(spec.as_str(), source, line)?;
                    out.push_str(&value);
                }
                _ => {
                    return Err(ConfigError::ParseError {
                        path: source.to_path_buf(),
                        line: Some(line),
                        message: "unclosed environment variable reference".to_string(),
                    });
                }
            }
        }
        out.push_str(&raw[last..]);
        Ok(out)
    }

    fn resolve(&mut self, spec: &str, source: &Path, line: usize) -> Result<String, ConfigError> {
        let (name, fallback) = if let Some((name, default)) = spec.split_once(":-") {
            (name, Fallback::Default(default))
        } else if let Some((name, message)) = spec.split_once(":?") {
            (name, Fallback::Required(message))
        } else {
            (spec, Fallback::Empty)
        };

        if !VAR_NAME_RE.is_match(name) {
            return Err(ConfigError::ParseError {
                path: source.to_path_buf(),
                line: Some(line),
                message: format!("invalid environment variable name '{name}'"),
            });
        }

        if let Ok(value) = std::env::var(name) {
            return Ok(value);
        }
        match fallback {
            Fallback::Default(default) => Ok(default.to_string()),
            Fallback::Required(message) => Err(ConfigError::EnvVarNotSet {
                var: name.to_string(),
                message: message.to_string(),
            }),
            Fallback::Empty => {
                self.warnings.push(LoadWarning {
                    message: format!(
                        "environment variable '{name}' is not set, using empty string"
                    ),
                    location: Some(format!("{}:{line}", source.display())),
                });
                Ok(String::new())
            }
        }
    }
}

enum Fallback<'a> {
    Default(&'a str),
    Required(&'a str),
    Empty,
}

/// Parses an environment variable, falling back to `default`.
fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Resolves `path` relative to the directory of `config_path`.
#[must_use]
pub fn resolve_relative(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    config_path
        .parent()
        .map_or_else(|| path.to_path_buf(), |dir| dir.join(path))
}

// ============================================================================
// Tests
// ============================================================================
