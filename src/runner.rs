//! Runs one session per agent concurrently.

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AgentConfig, RunConfig};
use crate::error::{AgentsError, SessionError};
use crate::observability::events::{EventEmitter, LifecycleEvent};
use crate::phase::ActionProducer;
use crate::session::Session;
use crate::transport::{ListenOutcome, Transport};

/// How one agent's session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    /// The server closed the connection.
    Closed,
    /// The session was stopped by shutdown.
    Stopped,
    /// The session could not be built, failed to connect, or its transport failed.
    Failed(String),
}

impl fmt::Display for AgentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

impl From<Result<ListenOutcome, SessionError>> for AgentOutcome {
    fn from(result: Result<ListenOutcome, SessionError>) -> Self {
        match result {
            Ok(ListenOutcome::Closed) => Self::Closed,
            Ok(ListenOutcome::Cancelled) => Self::Stopped,
            Ok(ListenOutcome::Failed(e)) => Self::Failed(e.to_string()),
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

/// Per-agent results of a run, sorted by agent id.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// `(agent id, outcome)` pairs.
    pub outcomes: Vec<(u32, AgentOutcome)>,
}

impl RunSummary {
    /// Number of agents whose session failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, AgentOutcome::Failed(_)))
            .count()
    }

    /// Returns `true` if no session failed.
    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.failed() == 0
    }
}

/// Builds a transport for an agent; used in place of the configured URL.
pub type TransportFactory = Arc<dyn Fn(&AgentConfig) -> Arc<dyn Transport> + Send + Sync>;

/// Spawns and supervises every agent of a game.
pub struct GameRunner {
    config: Arc<RunConfig>,
    agents: Vec<AgentConfig>,
    producer: Arc<dyn ActionProducer>,
    emitter: Arc<EventEmitter>,
    transport_factory: Option<TransportFactory>,
    shutdown: CancellationToken,
}

impl fmt::Debug for GameRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameRunner")
            .field("agents", &self.agents.len())
            .field("url", &self.config.server.url)
            .finish_non_exhaustive()
    }
}

impl GameRunner {
    /// Creates a runner for `agents`, acting through the config's scripted actions.
    #[must_use]
    pub fn new(config: Arc<RunConfig>, agents: Vec<AgentConfig>) -> Self {
        let producer = Arc::new(config.scripted_producer());
        Self {
            config,
            agents,
            producer,
            emitter: Arc::new(EventEmitter::noop()),
            transport_factory: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Replaces the scripted producer.
    #[must_use]
    pub fn with_producer(mut self, producer: Arc<dyn ActionProducer>) -> Self {
        self.producer = producer;
        self
    }

    /// Sets the lifecycle event sink shared by every session.
    #[must_use]
    pub fn with_emitter(mut self, emitter: Arc<EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Builds each agent's transport with `factory` instead of the server URL.
    #[must_use]
    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Stops every session when `token` is cancelled.
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Token that stops every session when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn build_session(&self, agent: &AgentConfig) -> Result<Session, AgentsError> {
        let mut builder = Session::builder()
            .agent_id(agent.id.to_string())
            .credentials(agent.credentials.clone())
            .schema(self.config.state.clone())
            .phase_config(self.config.phases.clone())
            .producer(Arc::clone(&self.producer))
            .emitter(Arc::clone(&self.emitter));
        builder = match &self.transport_factory {
            Some(factory) => builder.transport(factory(agent)),
            None => builder.url(self.config.server.url.clone()),
        };
        builder.build()
    }

    /// Runs every agent until all sessions end or shutdown is requested.
    ///
    /// One agent failing does not affect the others.
    pub async fn run(&self) -> RunSummary {
        let mut set = JoinSet::new();
        let mut outcomes = Vec::with_capacity(self.agents.len());

        for agent in &self.agents {
            let session = match self.build_session(agent) {
                Ok(session) => Arc::new(session),
                Err(e) => {
                    error!(agent_id = agent.id, error = %e, "could not build session");
                    outcomes.push((agent.id, AgentOutcome::Failed(e.to_string())));
                    continue;
                }
            };
            let shutdown = self.shutdown.clone();
            let id = agent.id;
            set.spawn(async move {
                let run = session.run();
                tokio::pin!(run);
                let result = tokio::select! {
                    result = &mut run => result,
                    () = shutdown.cancelled() => {
                        session.stop().await;
                        run.await
                    }
                };
                (id, AgentOutcome::from(result))
            });
        }
        info!(agents = set.len(), "agents started");

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, outcome)) => {
                    if let AgentOutcome::Failed(reason) = &outcome {
                        warn!(agent_id = id, reason = %reason, "agent session failed");
                    } else {
                        info!(agent_id = id, outcome = %outcome, "agent session ended");
                    }
                    outcomes.push((id, outcome));
                }
                Err(e) => error!(error = %e, "agent task panicked"),
            }
        }

        outcomes.sort_by_key(|(id, _)| *id);
        let summary = RunSummary { outcomes };
        self.emitter.emit(LifecycleEvent::RunCompleted {
            timestamp: chrono::Utc::now(),
            sessions: self.agents.len(),
            failed: summary.failed(),
        });
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::{Value, json};

    use super::*;
    use crate::transport::{ChannelPeer, ChannelTransport};

    fn config() -> Arc<RunConfig> {
        Arc::new(
            serde_yaml::from_str(
                r#"
server:
  url: ws://localhost:1
actions:
  2: { type: ready, recovery: "{{meta.recovery}}" }
state:
  meta:
    - name: recovery
"#,
            )
            .unwrap(),
        )
    }

    fn agents(n: u32) -> Vec<AgentConfig> {
        (1..=n)
            .map(|id| AgentConfig {
                id,
                credentials: json!({"type": "join", "recovery": format!("code-{id}")}),
            })
            .collect()
    }

    /// Hands out channel transports and keeps their peers.
    fn channel_factory(peers: Arc<Mutex<Vec<(u32, ChannelPeer)>>>) -> TransportFactory {
        Arc::new(move |agent: &AgentConfig| {
            let (transport, peer) = ChannelTransport::pair();
            peers.lock().unwrap().push((agent.id, peer));
            Arc::new(transport) as Arc<dyn Transport>
        })
    }

    #[tokio::test]
    async fn test_runs_every_agent_and_stops_on_shutdown() {
        let peers = Arc::new(Mutex::new(Vec::new()));
        let runner = GameRunner::new(config(), agents(3))
            .with_transport_factory(channel_factory(Arc::clone(&peers)));
        let shutdown = runner.shutdown_token();
        let runner = Arc::new(runner);
        let handle = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run().await })
        };

        let mut taken = Vec::new();
        while taken.len() < 3 {
            tokio::task::yield_now().await;
            taken.extend(peers.lock().unwrap().drain(..));
        }
        for (id, peer) in &mut taken {
            let login: Value = serde_json::from_str(&peer.next_sent().await.unwrap()).unwrap();
            assert_eq!(login["recovery"], format!("code-{id}"));
        }

        shutdown.cancel();
        let summary = handle.await.unwrap();
        assert_eq!(summary.outcomes.len(), 3);
        assert!(summary.all_ok());
        assert!(summary.outcomes.iter().all(|(_, o)| *o == AgentOutcome::Stopped));
        assert_eq!(
            summary.outcomes.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            [1, 2, 3]
        );
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_others() {
        let peers = Arc::new(Mutex::new(Vec::new()));
        let factory: TransportFactory = {
            let peers = Arc::clone(&peers);
            Arc::new(move |agent: &AgentConfig| {
                let (transport, peer) = ChannelTransport::pair();
                let transport = if agent.id == 2 {
                    transport.refuse_open()
                } else {
                    transport
                };
                peers.lock().unwrap().push((agent.id, peer));
                Arc::new(transport) as Arc<dyn Transport>
            })
        };
        let runner = GameRunner::new(config(), agents(2)).with_transport_factory(factory);
        let handle = {
            let runner = Arc::new(runner);
            tokio::spawn(async move { runner.run().await })
        };

        // Agent 1 acts, then its server hangs up.
        let mut peer_one = loop {
            tokio::task::yield_now().await;
            let mut peers = peers.lock().unwrap();
            if let Some(i) = peers.iter().position(|(id, _)| *id == 1) {
                break peers.swap_remove(i).1;
            }
        };
        let _login = peer_one.next_sent().await;
        peer_one.push_event("assign", json!({"recovery": "code-1"}));
        peer_one.push_event("phase-transition", json!({"phase": 2}));
        let action: Value = serde_json::from_str(&peer_one.next_sent().await.unwrap()).unwrap();
        assert_eq!(action, json!({"type": "ready", "recovery": "code-1"}));
        drop(peer_one);

        let summary = handle.await.unwrap();
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.outcomes[0], (1, AgentOutcome::Closed));
        assert!(matches!(summary.outcomes[1], (2, AgentOutcome::Failed(_))));
    }

    #[tokio::test]
    async fn test_invalid_session_config_reported_per_agent() {
        let mut bad = (*config()).clone();
        bad.phases.min_delay_secs = 30;
        bad.phases.max_delay_secs = 1;
        let summary = GameRunner::new(Arc::new(bad), agents(2)).run().await;
        assert_eq!(summary.failed(), 2);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(AgentOutcome::Closed.to_string(), "closed");
        assert_eq!(AgentOutcome::Failed("x".into()).to_string(), "failed: x");
    }
}
