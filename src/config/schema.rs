//! Configuration schema.
//!
//! Typed form of the YAML run configuration and of the game spec JSON file
//! that lists an experiment's recovery codes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::phase::{PhaseConfig, ScriptedProducer};
use crate::state::StateSchema;

/// Root of a run configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Game server connection settings.
    pub server: ServerSection,

    /// Phase machine settings.
    #[serde(default)]
    pub phases: PhaseConfig,

    /// Declared state fields.
    #[serde(default)]
    pub state: StateSchema,

    /// Scripted action payload per phase.
    #[serde(default)]
    pub actions: BTreeMap<PhaseKey, Value>,

    /// Agents with explicit credentials.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,

    /// Game spec file from which agents are derived.
    #[serde(default)]
    pub game_spec: Option<PathBuf>,
}

impl RunConfig {
    /// Builds the [`ScriptedProducer`] for the configured actions.
    ///
    /// Keys that are not integers are skipped; validation reports them.
    #[must_use]
    pub fn scripted_producer(&self) -> ScriptedProducer {
        let templates: HashMap<i64, Value> = self
            .actions
            .iter()
            .filter_map(|(key, payload)| key.phase().map(|p| (p, payload.clone())))
            .collect();
        ScriptedProducer::new(templates)
    }

    /// Returns `true` if an action is configured for `phase`.
    #[must_use]
    pub fn has_action(&self, phase: i64) -> bool {
        self.actions.keys().any(|k| k.phase() == Some(phase))
    }
}

/// Server section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// WebSocket URL (`ws://` or `wss://`).
    pub url: String,
}

/// Key of the `actions` table: YAML allows `3:` as well as `"3":`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhaseKey {
    /// Integer key.
    Number(i64),
    /// String key, valid only if it holds an integer.
    Text(String),
}

impl PhaseKey {
    /// The phase this key names, if it is an integer.
    #[must_use]
    pub fn phase(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for PhaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// One agent to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Agent id used in logs and events.
    pub id: u32,

    /// Credentials sent as the login frame.
    pub credentials: Value,
}

/// Game spec file produced when a game is created on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSpec {
    /// Server-side game id.
    pub game_id: i64,

    /// One recovery code per participant slot.
    #[serde(default)]
    pub recovery_codes: Vec<String>,
}

impl GameSpec {
    /// Derives one agent per recovery code, with ids starting at 1.
    #[must_use]
    pub fn agents(&self) -> Vec<AgentConfig> {
        (1..)
            .zip(&self.recovery_codes)
            .map(|(id, code)| AgentConfig {
                id,
                credentials: json!({
                    "gameId": self.game_id,
                    "type": "join",
                    "recovery": code,
                }),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
server:
  url: ws://localhost:8765/wss
phases:
  continuous: [6]
  min_delay_secs: 1
  max_delay_secs: 2
state:
  meta:
    - name: game_id
      default: 0
  private:
    - name: value
      kind: number
actions:
  3: { type: vote, gameId: "{{meta.game_id}}" }
  "6": { type: bid }
agents:
  - id: 1
    credentials: { type: join, gameId: 12, recovery: abc }
"#;

    #[test]
    fn test_parse_full_config() {
        let config: RunConfig = serde_yaml::from_str(FULL).unwrap();
        assert_eq!(config.server.url, "ws://localhost:8765/wss");
        assert!(config.phases.is_continuous(6));
        assert_eq!(config.state.private.len(), 1);
        assert_eq!(config.agents[0].id, 1);
        assert!(config.has_action(3));
        assert!(config.has_action(6));
        assert!(!config.has_action(4));
        assert_eq!(config.scripted_producer().phases().count(), 2);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "server:\n  url: ws://x\n  port: 3\n";
        assert!(serde_yaml::from_str::<RunConfig>(yaml).is_err());
    }

    #[test]
    fn test_phase_key_parsing() {
        assert_eq!(PhaseKey::Number(4).phase(), Some(4));
        assert_eq!(PhaseKey::Text("5".into()).phase(), Some(5));
        assert_eq!(PhaseKey::Text("vote".into()).phase(), None);
        assert_eq!(PhaseKey::Text("vote".into()).to_string(), "vote");
    }

    #[test]
    fn test_game_spec_agents() {
        let spec: GameSpec =
            serde_json::from_str(r#"{"game_id": 12, "recovery_codes": ["a1", "b2"]}"#).unwrap();
        let agents = spec.agents();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[1].id, 2);
        assert_eq!(
            agents[1].credentials,
            json!({"gameId": 12, "type": "join", "recovery": "b2"})
        );
    }
}
