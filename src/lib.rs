//! `econagents` - session orchestration for agents taking part in
//! multi-participant economic experiments.
//!
//! A [`session::Session`] keeps one WebSocket connection to the experiment
//! server, routes every server event through an
//! [`dispatch::EventDispatcher`], mirrors server state into a local
//! [`state::StateSnapshot`] and lets a [`phase::PhaseStateMachine`] decide
//! when the participant acts.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod phase;
pub mod runner;
pub mod session;
pub mod state;
pub mod transport;
