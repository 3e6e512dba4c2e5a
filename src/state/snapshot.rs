//! Three-namespace state snapshot.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field holding the current phase inside the `meta` namespace.
pub const PHASE_FIELD: &str = "phase";

/// One of the three independent state namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Session bookkeeping (game id, phase, player number).
    Meta,
    /// Information only this participant can see.
    Private,
    /// Information shared by all participants.
    Public,
}

impl Namespace {
    /// All namespaces in declaration order.
    pub const ALL: [Self; 3] = [Self::Meta, Self::Private, Self::Public];

    /// Lowercase name used in configuration and templates.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Meta => "meta",
            Self::Private => "private",
            Self::Public => "public",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "meta" => Ok(Self::Meta),
            "private" => Ok(Self::Private),
            "public" => Ok(Self::Public),
            other => Err(format!("unknown namespace '{other}'")),
        }
    }
}

/// Local copy of the experiment state as seen by one participant.
///
/// Each namespace is an open map of named JSON values. The current phase
/// lives in `meta.phase` and reads as 0 until the server sets it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Session bookkeeping fields.
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Participant-private fields.
    #[serde(default)]
    pub private: Map<String, Value>,
    /// Publicly shared fields.
    #[serde(default)]
    pub public: Map<String, Value>,
}

impl StateSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrows one namespace.
    #[must_use]
    pub const fn namespace(&self, ns: Namespace) -> &Map<String, Value> {
        match ns {
            Namespace::Meta => &self.meta,
            Namespace::Private => &self.private,
            Namespace::Public => &self.public,
        }
    }

    /// Mutably borrows one namespace.
    pub const fn namespace_mut(&mut self, ns: Namespace) -> &mut Map<String, Value> {
        match ns {
            Namespace::Meta => &mut self.meta,
            Namespace::Private => &mut self.private,
            Namespace::Public => &mut self.public,
        }
    }

    /// Reads one field.
    #[must_use]
    pub fn get(&self, ns: Namespace, field: &str) -> Option<&Value> {
        self.namespace(ns).get(field)
    }

    /// Overwrites one field, returning the previous value.
    pub fn set(&mut self, ns: Namespace, field: impl Into<String>, value: Value) -> Option<Value> {
        self.namespace_mut(ns).insert(field.into(), value)
    }

    /// Resolves a dotted `namespace.field` path.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let (ns, field) = path.split_once('.')?;
        let ns: Namespace = ns.parse().ok()?;
        self.get(ns, field)
    }

    /// Current phase as recorded in `meta.phase`.
    ///
    /// Integer strings are accepted; 0 when unset or not an integer.
    #[must_use]
    pub fn current_phase(&self) -> i64 {
        self.meta
            .get(PHASE_FIELD)
            .and_then(|v| {
                v.as_i64()
                    .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_current_phase_defaults_to_zero() {
        let mut state = StateSnapshot::new();
        assert_eq!(state.current_phase(), 0);
        state.set(Namespace::Meta, PHASE_FIELD, json!("three"));
        assert_eq!(state.current_phase(), 0);
        state.set(Namespace::Meta, PHASE_FIELD, json!(3));
        assert_eq!(state.current_phase(), 3);
        state.set(Namespace::Meta, PHASE_FIELD, json!("7"));
        assert_eq!(state.current_phase(), 7);
    }

    #[test]
    fn test_namespaces_are_independent() {
        let mut state = StateSnapshot::new();
        state.set(Namespace::Public, "value", json!(1));
        state.set(Namespace::Private, "value", json!(2));
        assert_eq!(state.get(Namespace::Public, "value"), Some(&json!(1)));
        assert_eq!(state.get(Namespace::Private, "value"), Some(&json!(2)));
        assert_eq!(state.get(Namespace::Meta, "value"), None);
    }

    #[test]
    fn test_lookup_dotted_path() {
        let mut state = StateSnapshot::new();
        state.set(Namespace::Meta, "game_id", json!(12));
        assert_eq!(state.lookup("meta.game_id"), Some(&json!(12)));
        assert_eq!(state.lookup("secret.game_id"), None);
        assert_eq!(state.lookup("game_id"), None);
    }

    #[test]
    fn test_namespace_round_trips_through_str() {
        for ns in Namespace::ALL {
            assert_eq!(ns.as_str().parse::<Namespace>().unwrap(), ns);
        }
        assert!("global".parse::<Namespace>().is_err());
    }
}
