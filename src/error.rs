//! Error types for `econagents`.
//!
//! A top-level [`AgentsError`] aggregates the per-domain errors and maps each
//! onto a process exit code. [`HandlerError`] is the failure type of every
//! user-supplied callable (hooks, handlers, phase actions, producers); those
//! failures are logged and isolated, never propagated out of a session.

use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Exit Codes
// ============================================================================

/// Exit codes for `econagents` CLI operations.
pub struct ExitCode;

impl ExitCode {
    /// Successful execution
    pub const SUCCESS: i32 = 0;

    /// General error
    pub const ERROR: i32 = 1;

    /// Configuration error (invalid YAML, validation failure)
    pub const CONFIG_ERROR: i32 = 2;

    /// I/O error (file not found, permission denied)
    pub const IO_ERROR: i32 = 3;

    /// Transport error (connection refused, handshake rejected)
    pub const TRANSPORT_ERROR: i32 = 4;

    /// Phase configuration error
    pub const PHASE_ERROR: i32 = 5;

    /// Usage error (invalid arguments)
    pub const USAGE_ERROR: i32 = 64;

    /// Interrupted by SIGINT (Ctrl+C)
    pub const INTERRUPTED: i32 = 130;

    /// Terminated by SIGTERM
    pub const TERMINATED: i32 = 143;
}

// ============================================================================
// Top-Level Error
// ============================================================================

/// Top-level error type for `econagents` operations.
#[derive(Debug, Error)]
pub enum AgentsError {
    /// Configuration loading or validation error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Transport layer error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// State synchronizer construction error
    #[error(transparent)]
    State(#[from] StateError),

    /// Phase machine error
    #[error(transparent)]
    Phase(#[from] PhaseError),

    /// Session assembly error
    #[error(transparent)]
    Session(#[from] SessionError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl AgentsError {
    /// Returns the appropriate exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Json(_) | Self::Yaml(_) | Self::State(_) => {
                ExitCode::CONFIG_ERROR
            }
            Self::Transport(_) => ExitCode::TRANSPORT_ERROR,
            Self::Phase(_) => ExitCode::PHASE_ERROR,
            Self::Session(_) => ExitCode::ERROR,
            Self::Io(_) => ExitCode::IO_ERROR,
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML or JSON parsing failed
    #[error("parse error in {path}: {message}")]
    ParseError {
        /// Path to the configuration file
        path: PathBuf,
        /// Line number where the error occurred (if available)
        line: Option<usize>,
        /// Error message from the parser
        message: String,
    },

    /// Configuration validation failed
    #[error("validation failed for {path}")]
    ValidationError {
        /// Path to the configuration file
        path: String,
        /// List of validation issues found
        errors: Vec<ValidationIssue>,
    },

    /// Referenced configuration file not found
    #[error("file not found: {path}")]
    MissingFile {
        /// Path to the missing file
        path: PathBuf,
    },

    /// Required field is missing from configuration
    #[error("missing required field '{field}' at {location}")]
    MissingRequired {
        /// Name of the missing field
        field: String,
        /// Location in the configuration (e.g., "server.url")
        location: String,
    },

    /// Field has an invalid value
    #[error("invalid value for '{field}': got '{value}', expected {expected}")]
    InvalidValue {
        /// Name of the field with invalid value
        field: String,
        /// The actual value provided
        value: String,
        /// Description of what was expected
        expected: String,
    },

    /// Environment variable referenced in configuration is not set
    #[error("environment variable '{var}' not set ({message})")]
    EnvVarNotSet {
        /// Name of the environment variable
        var: String,
        /// Message supplied by the `${VAR:?message}` form
        message: String,
    },
}

// ============================================================================
// Validation Types
// ============================================================================

/// A single validation issue found during configuration validation.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the problematic field (e.g., "state.public[2].events")
    pub path: String,
    /// Description of the validation issue
    pub message: String,
    /// Severity level of the issue
    pub severity: Severity,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {} at {}", prefix, self.message, self.path)
    }
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Prevents the configuration from being used
    Error,
    /// Reported but does not block loading
    Warning,
}

// ============================================================================
// Transport Errors
// ============================================================================

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error during transport operations
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to establish connection
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation attempted before `open()` succeeded or after `close()`
    #[error("not connected")]
    NotConnected,

    /// WebSocket protocol error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection was closed unexpectedly
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Inbound frame was not a valid event envelope
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

// ============================================================================
// State Errors
// ============================================================================

/// Errors raised while building or applying state field mappings.
#[derive(Debug, Error)]
pub enum StateError {
    /// A filter was given both an allow-list and a deny-list
    #[error("field '{field}': {filter} filter cannot set both an allow-list and a deny-list")]
    ConflictingFilter {
        /// Target field of the offending mapping
        field: String,
        /// Which filter conflicted (`"event"` or `"phase"`)
        filter: &'static str,
    },

    /// A value did not match the declared kind of its field
    #[error("field '{field}': expected {expected}, got {actual}")]
    TypeMismatch {
        /// Target field
        field: String,
        /// Declared kind
        expected: String,
        /// Kind of the offending value
        actual: String,
    },

    /// The same field name was declared twice within one namespace
    #[error("duplicate field '{field}' in namespace {namespace}")]
    DuplicateField {
        /// Field name
        field: String,
        /// Namespace name
        namespace: String,
    },
}

// ============================================================================
// Phase Errors
// ============================================================================

/// Phase state machine errors.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// `min_delay_secs` exceeds `max_delay_secs`
    #[error("invalid delay range: min {min}s exceeds max {max}s")]
    InvalidDelayRange {
        /// Configured minimum delay
        min: u64,
        /// Configured maximum delay
        max: u64,
    },

    /// The phase key carried a value that is neither an integer nor null
    #[error("invalid phase value for '{key}': {value}")]
    InvalidPhaseValue {
        /// Phase key looked up in the event data
        key: String,
        /// The offending value, serialized
        value: String,
    },
}

// ============================================================================
// Session Errors
// ============================================================================

/// Errors raised while assembling a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A required collaborator was not supplied to the builder
    #[error("missing required collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// The transport could not connect or authenticate
    #[error("session {agent_id} failed to connect")]
    ConnectFailed {
        /// Agent identifier
        agent_id: String,
    },

    /// Some sessions of a game run failed
    #[error("{failed} of {total} agent sessions failed")]
    AgentsFailed {
        /// Number of failed sessions
        failed: usize,
        /// Number of sessions started
        total: usize,
    },
}

// ============================================================================
// Handler Errors
// ============================================================================

/// Failure of a hook, handler, phase action or action producer.
///
/// Always caught at the call site, logged, and isolated to the one invocation.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Generic failure reported by the callable
    #[error("{0}")]
    Failed(String),

    /// Transport failure inside the callable
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// State mapping failure inside the callable
    #[error(transparent)]
    State(#[from] StateError),

    /// Phase value failure inside the callable
    #[error(transparent)]
    Phase(#[from] PhaseError),

    /// JSON failure inside the callable
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HandlerError {
    /// Convenience constructor for [`HandlerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Result type alias for `econagents` operations.
pub type Result<T> = std::result::Result<T, AgentsError>;

// ============================================================================
// Tests
// ============================================================================
