//! Run configuration: YAML schema, loader and validator.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{ConfigLimits, ConfigLoader, LoadResult, LoadWarning, load_game_spec};
pub use schema::{AgentConfig, GameSpec, PhaseKey, RunConfig, ServerSection};
pub use validation::{ValidationResult, Validator};
