//! Phase tracking and action scheduling.

pub mod action;
pub mod config;
pub mod machine;

pub use action::{
    ActionProducer, NoopLifecycle, PhaseLifecycle, PhaseOverrides, ScriptedProducer,
    is_empty_payload,
};
pub use config::{DEFAULT_PHASE_KEY, DEFAULT_TRANSITION_EVENT, PhaseConfig};
pub use machine::PhaseStateMachine;
