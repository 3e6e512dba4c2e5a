//! One participant's session.
//!
//! [`SessionBuilder`] wires the pieces together: frames read by the
//! [`Connection`] are parsed into [`Event`]s and run through the
//! [`EventDispatcher`]; the [`StateSynchronizer`] is a global pre-hook, so
//! state is current before any handler sees the event, and the
//! [`PhaseStateMachine`] is the handler for the transition event type.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::dispatch::{Callback, Event, EventDispatcher};
use crate::error::{AgentsError, HandlerError, SessionError};
use crate::observability::events::{EventEmitter, LifecycleEvent};
use crate::observability::metrics;
use crate::phase::{
    ActionProducer, PhaseConfig, PhaseLifecycle, PhaseOverrides, PhaseStateMachine,
};
use crate::state::{
    CustomHandler, FieldKind, FieldMapping, Namespace, PHASE_FIELD, StateSchema, StateSnapshot,
    StateSynchronizer,
};
use crate::transport::{
    AuthStrategy, Connection, ListenOutcome, LoginPayloadAuth, Transport, TransportType,
    WebSocketTransport,
};

/// Builder for [`Session`].
///
/// An agent id, credentials and either a transport or a server URL are
/// required; everything else has a default.
pub struct SessionBuilder {
    agent_id: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    url: Option<String>,
    auth: Arc<dyn AuthStrategy>,
    credentials: Option<Value>,
    schema: StateSchema,
    custom_state: HashMap<String, CustomHandler>,
    phase_config: PhaseConfig,
    producer: Option<Arc<dyn ActionProducer>>,
    lifecycle: Option<Arc<dyn PhaseLifecycle>>,
    overrides: PhaseOverrides,
    emitter: Arc<EventEmitter>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            agent_id: None,
            transport: None,
            url: None,
            auth: Arc::new(LoginPayloadAuth),
            credentials: None,
            schema: StateSchema::default(),
            custom_state: HashMap::new(),
            phase_config: PhaseConfig::default(),
            producer: None,
            lifecycle: None,
            overrides: PhaseOverrides::new(),
            emitter: Arc::new(EventEmitter::noop()),
        }
    }
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("agent_id", &self.agent_id)
            .field("url", &self.url)
            .field("phase_config", &self.phase_config)
            .finish_non_exhaustive()
    }
}

impl SessionBuilder {
    /// Creates a builder with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the agent id used in logs and events.
    #[must_use]
    pub fn agent_id(mut self, id: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self
    }

    /// Uses an explicit transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Connects with a [`WebSocketTransport`] to `url`, unless a transport
    /// is also set.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Replaces the default [`LoginPayloadAuth`] handshake.
    #[must_use]
    pub fn auth(mut self, auth: Arc<dyn AuthStrategy>) -> Self {
        self.auth = auth;
        self
    }

    /// Credentials handed to the handshake.
    #[must_use]
    pub fn credentials(mut self, credentials: Value) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Declared state fields.
    #[must_use]
    pub fn schema(mut self, schema: StateSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Replaces declarative mapping for `event_type` with `handler`.
    #[must_use]
    pub fn custom_state_handler<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str, &Map<String, Value>, &mut StateSnapshot) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.custom_state.insert(event_type.into(), Arc::new(handler));
        self
    }

    /// Phase settings.
    #[must_use]
    pub fn phase_config(mut self, config: PhaseConfig) -> Self {
        self.phase_config = config;
        self
    }

    /// Producer asked for an action on each phase.
    #[must_use]
    pub fn producer(mut self, producer: Arc<dyn ActionProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Phase start/end hooks.
    #[must_use]
    pub fn lifecycle(mut self, lifecycle: Arc<dyn PhaseLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Per-phase handlers that take precedence over the producer.
    #[must_use]
    pub fn overrides(mut self, overrides: PhaseOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Lifecycle event sink.
    #[must_use]
    pub fn emitter(mut self, emitter: Arc<EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Assembles the session.
    ///
    /// # Errors
    ///
    /// Fails if a required collaborator is missing, the phase delay range is
    /// inverted, or the state schema does not compile.
    pub fn build(self) -> Result<Session, AgentsError> {
        let agent_id = self
            .agent_id
            .ok_or(SessionError::MissingCollaborator("agent_id"))?;
        let transport: Arc<dyn Transport> = match (self.transport, self.url) {
            (Some(transport), _) => transport,
            (None, Some(url)) => Arc::new(WebSocketTransport::new(url)),
            (None, None) => return Err(SessionError::MissingCollaborator("transport").into()),
        };
        let credentials = self
            .credentials
            .ok_or(SessionError::MissingCollaborator("credentials"))?;
        self.phase_config.validate()?;

        let mut sync = StateSynchronizer::new(self.schema.initial_snapshot(), self.schema.mappings()?);
        if !self.schema.declares(Namespace::Meta, PHASE_FIELD) {
            sync.push_mapping(
                FieldMapping::builder(&self.phase_config.phase_key, Namespace::Meta, PHASE_FIELD)
                    .events([self.phase_config.transition_event.as_str()])
                    .kind(FieldKind::Phase)
                    .build()?,
            );
        }
        for (event_type, handler) in self.custom_state {
            sync = sync.with_custom_handler(event_type, move |t, d, s| handler(t, d, s));
        }
        let state = Arc::new(sync);

        let transport_type = transport.transport_type();
        let connection = Arc::new(Connection::new(transport, self.auth, credentials));

        let transition_event = self.phase_config.transition_event.clone();
        let mut machine =
            PhaseStateMachine::new(self.phase_config, Arc::clone(&connection), Arc::clone(&state))?
                .with_overrides(self.overrides)
                .with_emitter(Arc::clone(&self.emitter), agent_id.clone());
        if let Some(producer) = self.producer {
            machine = machine.with_producer(producer);
        }
        if let Some(lifecycle) = self.lifecycle {
            machine = machine.with_lifecycle(lifecycle);
        }
        let machine = Arc::new(machine);

        let dispatcher = Arc::new(EventDispatcher::new());
        let sync_state = Arc::clone(&state);
        dispatcher
            .register_global_pre_hook(Callback::sync(move |event| {
                sync_state.update(event).map(|_| ())
            }))
            .register_handler(&transition_event, machine.transition_callback());

        Ok(Session {
            agent_id,
            session_id: uuid::Uuid::new_v4().to_string(),
            transport_type,
            connection,
            dispatcher,
            state,
            machine,
            emitter: self.emitter,
        })
    }
}

/// A running participant: connection, dispatcher, state and phase machine.
pub struct Session {
    agent_id: String,
    session_id: String,
    transport_type: TransportType,
    connection: Arc<Connection>,
    dispatcher: Arc<EventDispatcher>,
    state: Arc<StateSynchronizer>,
    machine: Arc<PhaseStateMachine>,
    emitter: Arc<EventEmitter>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("agent_id", &self.agent_id)
            .field("session_id", &self.session_id)
            .field("transport", &self.transport_type)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Starts a [`SessionBuilder`].
    #[must_use]
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Agent id.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Unique id of this session instance.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Dispatcher, for registering extra hooks and handlers.
    #[must_use]
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// State synchronizer.
    #[must_use]
    pub fn state(&self) -> &StateSynchronizer {
        &self.state
    }

    /// Phase state machine.
    #[must_use]
    pub fn phase_machine(&self) -> &PhaseStateMachine {
        &self.machine
    }

    /// Connects, then processes frames until the connection ends.
    ///
    /// Events are handled one at a time in arrival order. When the loop ends
    /// for any reason the continuous task is cancelled and the transport
    /// closed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ConnectFailed`] if connecting or
    /// authenticating fails.
    pub async fn run(&self) -> Result<ListenOutcome, SessionError> {
        let span = info_span!("session", agent_id = %self.agent_id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<ListenOutcome, SessionError> {
        if !self.connection.connect().await {
            return Err(SessionError::ConnectFailed {
                agent_id: self.agent_id.clone(),
            });
        }
        metrics::session_started();
        self.emitter.emit(LifecycleEvent::session_started(
            &self.agent_id,
            &self.session_id,
            &self.transport_type.to_string(),
        ));
        info!(session_id = %self.session_id, "session started");

        let outcome = self
            .connection
            .start_listening(|frame| self.handle_frame(frame))
            .await;

        self.stop().await;
        metrics::session_stopped();
        let reason = match &outcome {
            ListenOutcome::Closed => "connection closed".to_string(),
            ListenOutcome::Cancelled => "stopped".to_string(),
            ListenOutcome::Failed(e) => format!("transport failure: {e}"),
        };
        info!(reason = %reason, "session ended");
        self.emitter
            .emit(LifecycleEvent::session_stopped(&self.agent_id, reason));
        Ok(outcome)
    }

    async fn handle_frame(&self, frame: String) {
        let event = match Event::parse(&frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };
        if !event.is_routable() {
            debug!(message_type = %event.message_type, "ignoring non-event frame");
            return;
        }
        metrics::record_event(&event.event_type);
        self.emitter
            .emit(LifecycleEvent::event_received(&self.agent_id, &event.event_type));
        self.dispatcher.on(event).await;
    }

    /// Cancels the continuous task and closes the transport.
    ///
    /// Safe to call at any time, repeatedly, and from another task while
    /// [`run`](Self::run) is in progress.
    pub async fn stop(&self) {
        self.machine.stop().await;
        self.connection.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::phase::ScriptedProducer;
    use crate::state::FieldSpec;
    use crate::transport::{ChannelPeer, ChannelTransport};

    fn schema() -> StateSchema {
        let mut value = FieldSpec::new("value");
        value.default = json!(0);
        let mut round = FieldSpec::new("round");
        round.default = json!(1);
        round.events = Some(vec!["round-started".to_string()]);
        StateSchema {
            meta: vec![FieldSpec::new("game_id")],
            private: vec![value],
            public: vec![round],
        }
    }

    fn producer() -> Arc<ScriptedProducer> {
        Arc::new(ScriptedProducer::new(HashMap::from([(
            3,
            json!({"type": "bid", "gameId": "{{meta.game_id}}", "value": "{{private.value}}"}),
        )])))
    }

    fn session() -> (Arc<Session>, ChannelPeer) {
        let (transport, peer) = ChannelTransport::pair();
        let session = Session::builder()
            .agent_id("1")
            .transport(Arc::new(transport))
            .credentials(json!({"type": "join", "gameId": 12, "recovery": "abc"}))
            .schema(schema())
            .producer(producer())
            .build()
            .unwrap();
        (Arc::new(session), peer)
    }

    fn spawn_run(
        session: &Arc<Session>,
    ) -> tokio::task::JoinHandle<Result<ListenOutcome, SessionError>> {
        let session = Arc::clone(session);
        tokio::spawn(async move { session.run().await })
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = Session::builder().credentials(json!({})).url("ws://x").build();
        assert!(matches!(
            err,
            Err(AgentsError::Session(SessionError::MissingCollaborator("agent_id")))
        ));

        let err = Session::builder().agent_id("1").credentials(json!({})).build();
        assert!(matches!(
            err,
            Err(AgentsError::Session(SessionError::MissingCollaborator("transport")))
        ));

        let err = Session::builder().agent_id("1").url("ws://x").build();
        assert!(matches!(
            err,
            Err(AgentsError::Session(SessionError::MissingCollaborator("credentials")))
        ));
    }

    #[test]
    fn test_builder_rejects_inverted_delays() {
        let err = Session::builder()
            .agent_id("1")
            .url("ws://localhost:1")
            .credentials(json!({}))
            .phase_config(PhaseConfig {
                min_delay_secs: 3,
                max_delay_secs: 1,
                ..PhaseConfig::default()
            })
            .build();
        assert!(matches!(err, Err(AgentsError::Phase(_))));
    }

    #[test]
    fn test_default_phase_mapping_installed() {
        let (session, _peer) = session();
        let phase_mapping = session
            .state()
            .mappings()
            .iter()
            .find(|m| m.namespace() == Namespace::Meta && m.target_field() == PHASE_FIELD)
            .unwrap();
        assert_eq!(phase_mapping.source_key(), "phase");
        assert!(phase_mapping.applies("phase-transition", 0));
        assert!(!phase_mapping.applies("other", 0));
    }

    #[tokio::test]
    async fn test_events_update_state_and_drive_actions() {
        let (session, mut peer) = session();
        let run = spawn_run(&session);

        let login: Value = serde_json::from_str(&peer.next_sent().await.unwrap()).unwrap();
        assert_eq!(login["recovery"], "abc");

        peer.push_event("assign-value", json!({"value": 150, "game_id": 12}));
        peer.push("this is not json");
        peer.push(json!({"type": "ack"}).to_string());
        peer.push_event("phase-transition", json!({"phase": 3}));

        let action: Value = serde_json::from_str(&peer.next_sent().await.unwrap()).unwrap();
        assert_eq!(action, json!({"type": "bid", "gameId": 12, "value": 150}));

        let snapshot = session.state().snapshot();
        assert_eq!(snapshot.current_phase(), 3);
        assert_eq!(session.phase_machine().current_phase(), Some(3));

        drop(peer);
        let outcome = run.await.unwrap().unwrap();
        assert!(matches!(outcome, ListenOutcome::Closed));
    }

    #[tokio::test]
    async fn test_handlers_see_synchronized_state() {
        let (session, mut peer) = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            let state = Arc::clone(&session.state);
            session.dispatcher().register_handler(
                "round-started",
                Callback::sync(move |_| {
                    let round = state.snapshot().get(Namespace::Public, "round").cloned();
                    seen.lock().unwrap().push(round);
                    Ok(())
                }),
            );
        }
        let run = spawn_run(&session);
        let _login = peer.next_sent().await;

        peer.push_event("round-started", json!({"round": 2}));
        peer.push_event("phase-transition", json!({"phase": 3}));
        let _action = peer.next_sent().await;

        assert_eq!(*seen.lock().unwrap(), [Some(json!(2))]);
        session.stop().await;
        assert!(matches!(run.await.unwrap(), Ok(ListenOutcome::Cancelled)));
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_end_session() {
        let (session, mut peer) = session();
        session.dispatcher().register_global_handler(Callback::sync(|_| {
            Err(HandlerError::failed("handler broke"))
        }));
        let run = spawn_run(&session);
        let _login = peer.next_sent().await;

        peer.push_event("anything", json!({}));
        peer.push_event("phase-transition", json!({"phase": 3}));
        assert!(peer.next_sent().await.is_some());

        session.stop().await;
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let (transport, _peer) = ChannelTransport::pair();
        let session = Session::builder()
            .agent_id("7")
            .transport(Arc::new(transport.refuse_open()))
            .credentials(json!({}))
            .build()
            .unwrap();

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectFailed { agent_id } if agent_id == "7"));
    }

    #[tokio::test]
    async fn test_custom_state_handler_replaces_mapping() {
        let (transport, mut peer) = ChannelTransport::pair();
        let session = Arc::new(
            Session::builder()
                .agent_id("1")
                .transport(Arc::new(transport))
                .credentials(json!({}))
                .schema(schema())
                .custom_state_handler("assign-value", |_, data, state| {
                    let doubled = data.get("value").and_then(Value::as_i64).unwrap_or(0) * 2;
                    state.set(Namespace::Private, "value", json!(doubled));
                    Ok(())
                })
                .build()
                .unwrap(),
        );
        let run = spawn_run(&session);
        let _login = peer.next_sent().await;

        peer.push_event("assign-value", json!({"value": 21, "game_id": 99}));
        drop(peer);
        run.await.unwrap().unwrap();

        let snapshot = session.state().snapshot();
        assert_eq!(snapshot.get(Namespace::Private, "value"), Some(&json!(42)));
        assert_eq!(snapshot.get(Namespace::Meta, "game_id"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_unparseable_phase_leaves_state_phase_unchanged() {
        let mut schema = schema();
        let mut bid = FieldSpec::new("bid");
        bid.phases = Some(vec![3]);
        schema.private.push(bid);

        let (transport, mut peer) = ChannelTransport::pair();
        let session = Arc::new(
            Session::builder()
                .agent_id("1")
                .transport(Arc::new(transport))
                .credentials(json!({}))
                .schema(schema)
                .producer(producer())
                .build()
                .unwrap(),
        );
        let run = spawn_run(&session);
        let _login = peer.next_sent().await;

        peer.push_event("phase-transition", json!({"phase": 3}));
        let _action = peer.next_sent().await;
        peer.push_event("phase-transition", json!({"phase": "six"}));
        peer.push_event("update", json!({"bid": 42}));
        drop(peer);
        run.await.unwrap().unwrap();

        let snapshot = session.state().snapshot();
        assert_eq!(session.phase_machine().current_phase(), Some(3));
        assert_eq!(snapshot.get(Namespace::Meta, PHASE_FIELD), Some(&json!(3)));
        assert_eq!(snapshot.current_phase(), 3);
        assert_eq!(snapshot.get(Namespace::Private, "bid"), Some(&json!(42)));
    }
}
