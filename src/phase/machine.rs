//! Phase state machine.
//!
//! Tracks the current phase from transition events and decides how often to
//! act: once on entering a discrete phase, or once immediately and then at
//! randomized intervals for a continuous phase. At most one continuous loop
//! is alive at any instant; every transition out of (or back into) a
//! continuous phase cancels the running loop and waits for it to finish
//! before anything else happens.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::dispatch::{Callback, Event, isolate};
use crate::error::{HandlerError, PhaseError};
use crate::observability::events::{EventEmitter, LifecycleEvent};
use crate::observability::metrics;
use crate::state::StateSynchronizer;
use crate::transport::Connection;

use super::action::{ActionProducer, NoopLifecycle, PhaseLifecycle, PhaseOverrides, is_empty_payload};
use super::config::PhaseConfig;

/// Handle to the running continuous loop.
struct ContinuousTask {
    phase: i64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ContinuousTask {
    /// Cancels the loop and waits until it has exited.
    async fn cancel_and_wait(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!(phase = self.phase, "continuous loop panicked");
            }
        }
    }
}

/// Decrements the live-loop counter when a loop task ends, however it ends.
struct LoopGuard(Arc<AtomicUsize>);

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        metrics::set_continuous_loops(self.0.load(Ordering::SeqCst));
    }
}

/// Phase-driven action scheduler for one session.
pub struct PhaseStateMachine {
    config: PhaseConfig,
    connection: Arc<Connection>,
    state: Arc<StateSynchronizer>,
    producer: Option<Arc<dyn ActionProducer>>,
    overrides: PhaseOverrides,
    lifecycle: Arc<dyn PhaseLifecycle>,
    emitter: Arc<EventEmitter>,
    agent_id: String,

    current_phase: Mutex<Option<i64>>,
    in_continuous: AtomicBool,
    task: tokio::sync::Mutex<Option<ContinuousTask>>,
    live_loops: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for PhaseStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseStateMachine")
            .field("agent_id", &self.agent_id)
            .field("config", &self.config)
            .field("current_phase", &self.current_phase())
            .field("in_continuous_mode", &self.in_continuous_mode())
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

impl PhaseStateMachine {
    /// Creates a machine that acts through `connection` using `state`.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::InvalidDelayRange`] for an inverted delay range.
    pub fn new(
        config: PhaseConfig,
        connection: Arc<Connection>,
        state: Arc<StateSynchronizer>,
    ) -> Result<Self, PhaseError> {
        config.validate()?;
        Ok(Self {
            config,
            connection,
            state,
            producer: None,
            overrides: PhaseOverrides::new(),
            lifecycle: Arc::new(NoopLifecycle),
            emitter: Arc::new(EventEmitter::noop()),
            agent_id: String::new(),
            current_phase: Mutex::new(None),
            in_continuous: AtomicBool::new(false),
            task: tokio::sync::Mutex::new(None),
            live_loops: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Sets the action producer.
    #[must_use]
    pub fn with_producer(mut self, producer: Arc<dyn ActionProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Sets the per-phase override table.
    #[must_use]
    pub fn with_overrides(mut self, overrides: PhaseOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Sets the lifecycle hooks.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn PhaseLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Sets the lifecycle event sink and the agent id stamped on its events.
    #[must_use]
    pub fn with_emitter(mut self, emitter: Arc<EventEmitter>, agent_id: impl Into<String>) -> Self {
        self.emitter = emitter;
        self.agent_id = agent_id.into();
        self
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &PhaseConfig {
        &self.config
    }

    /// Current phase, `None` before the first transition or after a null one.
    #[must_use]
    pub fn current_phase(&self) -> Option<i64> {
        *self
            .current_phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` while a continuous loop is meant to be running.
    #[must_use]
    pub fn in_continuous_mode(&self) -> bool {
        self.in_continuous.load(Ordering::SeqCst)
    }

    /// Number of continuous loop tasks currently alive (0 or 1).
    #[must_use]
    pub fn live_loops(&self) -> usize {
        self.live_loops.load(Ordering::SeqCst)
    }

    /// Returns a dispatcher callback that feeds transition events to this machine.
    pub fn transition_callback(self: &Arc<Self>) -> Callback {
        let machine = Arc::clone(self);
        Callback::new(move |event: Arc<Event>| {
            let machine = Arc::clone(&machine);
            async move { machine.on_transition_event(&event).await }
        })
    }

    /// Handles one transition event.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::InvalidPhaseValue`] (no transition happens) when
    /// the phase key holds something other than an integer or null.
    pub async fn on_transition_event(self: &Arc<Self>, event: &Event) -> Result<(), HandlerError> {
        let new_phase = self
            .config
            .parse_phase(event.data.get(&self.config.phase_key))?;
        self.handle_transition(new_phase).await;
        Ok(())
    }

    /// Moves to `new_phase` and performs the resulting action(s).
    ///
    /// Any running continuous loop is cancelled and awaited first, even when
    /// `new_phase` equals the current phase; re-entering a continuous phase
    /// restarts its loop.
    pub async fn handle_transition(self: &Arc<Self>, new_phase: Option<i64>) {
        info!(phase = ?new_phase, "transitioning phase");
        let mut slot = self.task.lock().await;
        let old_phase = self.current_phase();

        if self.in_continuous.swap(false, Ordering::SeqCst) {
            if new_phase == old_phase {
                debug!(phase = ?old_phase, "re-entering continuous phase, restarting loop");
            } else {
                info!(phase = ?old_phase, "stopping continuous phase");
            }
            if let Some(task) = slot.take() {
                task.cancel_and_wait().await;
            }
        }

        if let Some(old) = old_phase {
            if let Err(e) = isolate(self.lifecycle.on_phase_end(old)).await {
                warn!(phase = old, error = %e, "on_phase_end failed");
                metrics::record_callable_failure("on_phase_end");
            }
            self.emitter.emit(LifecycleEvent::phase_exited(&self.agent_id, old));
        }

        *self
            .current_phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = new_phase;
        metrics::record_phase_transition();

        let Some(phase) = new_phase else {
            return;
        };

        if let Err(e) = isolate(self.lifecycle.on_phase_start(phase)).await {
            warn!(phase, error = %e, "on_phase_start failed");
            metrics::record_callable_failure("on_phase_start");
        }
        let continuous = self.config.is_continuous(phase);
        self.emitter
            .emit(LifecycleEvent::phase_entered(&self.agent_id, phase, continuous));

        if continuous {
            if self.shutdown.is_cancelled() {
                debug!(phase, "machine stopped, continuous loop not started");
            } else {
                self.in_continuous.store(true, Ordering::SeqCst);
                *slot = Some(self.spawn_continuous(phase));
            }
        }
        drop(slot);

        self.execute_phase_action(phase).await;
    }

    fn spawn_continuous(self: &Arc<Self>, phase: i64) -> ContinuousTask {
        let cancel = self.shutdown.child_token();
        self.live_loops.fetch_add(1, Ordering::SeqCst);
        metrics::set_continuous_loops(self.live_loops.load(Ordering::SeqCst));
        let guard = LoopGuard(Arc::clone(&self.live_loops));

        let machine = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(
            async move {
                let _guard = guard;
                machine.continuous_loop(phase, token).await;
            }
            .in_current_span(),
        );
        ContinuousTask {
            phase,
            cancel,
            handle,
        }
    }

    async fn continuous_loop(&self, phase: i64, cancel: CancellationToken) {
        while self.in_continuous_mode() {
            let delay = self.config.random_delay();
            debug!(phase, delay_secs = delay.as_secs(), "waiting before next action");
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(phase, "continuous phase loop cancelled");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }

            if !self.in_continuous_mode() || self.current_phase() != Some(phase) {
                break;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(phase, "continuous phase loop cancelled");
                    return;
                }
                _ = self.execute_phase_action(phase) => {}
            }
        }
        debug!(phase, "continuous phase loop finished");
    }

    /// Produces and sends one action for `phase`.
    ///
    /// An override for the phase takes precedence over the producer. Failures
    /// are logged; empty payloads and a missing producer send nothing.
    /// Returns `true` if a payload was sent.
    pub async fn execute_phase_action(&self, phase: i64) -> bool {
        let state = self.state.snapshot();
        let produced = if let Some(action) = self.overrides.call(phase, &state) {
            isolate(action).await
        } else if let Some(producer) = &self.producer {
            isolate(producer.handle_phase(phase, &state)).await
        } else {
            info!(phase, "no action producer configured, nothing sent");
            return false;
        };

        let payload = match produced {
            Ok(Some(payload)) if !is_empty_payload(&payload) => payload,
            Ok(_) => {
                debug!(phase, "no action for phase");
                return false;
            }
            Err(e) => {
                warn!(phase, error = %e, "phase action failed");
                metrics::record_callable_failure("phase_action");
                return false;
            }
        };

        let text = match serde_json::to_string(&payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(phase, error = %e, "could not serialize action");
                return false;
            }
        };
        self.connection.send(&text).await;

        let mode = if self.config.is_continuous(phase) {
            "continuous"
        } else {
            "discrete"
        };
        metrics::record_action(mode);
        self.emitter
            .emit(LifecycleEvent::action_sent(&self.agent_id, phase, text.len()));
        true
    }

    /// Cancels the continuous loop, if any, and blocks new ones.
    ///
    /// Idempotent and safe to call while a transition is in progress.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.in_continuous.store(false, Ordering::SeqCst);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.cancel_and_wait().await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::state::StateSnapshot;
    use crate::transport::{ChannelPeer, ChannelTransport, LoginPayloadAuth};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    #[async_trait::async_trait]
    impl PhaseLifecycle for Recorder {
        async fn on_phase_start(&self, phase: i64) -> Result<(), HandlerError> {
            self.push(format!("start:{phase}"));
            Ok(())
        }

        async fn on_phase_end(&self, phase: i64) -> Result<(), HandlerError> {
            self.push(format!("end:{phase}"));
            Ok(())
        }
    }

    struct EchoProducer;

    #[async_trait::async_trait]
    impl ActionProducer for EchoProducer {
        async fn handle_phase(
            &self,
            phase: i64,
            _state: &StateSnapshot,
        ) -> Result<Option<Value>, HandlerError> {
            match phase {
                13 => Err(HandlerError::failed("producer exploded")),
                99 => Ok(Some(json!({}))),
                _ => Ok(Some(json!({"type": "act", "phase": phase}))),
            }
        }
    }

    fn config(continuous: &[i64]) -> PhaseConfig {
        PhaseConfig {
            continuous: continuous.iter().copied().collect::<HashSet<_>>(),
            min_delay_secs: 5,
            max_delay_secs: 5,
            ..PhaseConfig::default()
        }
    }

    async fn machine(
        config: PhaseConfig,
    ) -> (Arc<PhaseStateMachine>, ChannelPeer, Arc<Recorder>) {
        let (transport, mut peer) = ChannelTransport::pair();
        let connection = Arc::new(Connection::new(
            Arc::new(transport),
            Arc::new(LoginPayloadAuth),
            json!({"type": "join"}),
        ));
        assert!(connection.connect().await);
        let _login = peer.next_sent().await;

        let recorder = Arc::new(Recorder::default());
        let state = Arc::new(StateSynchronizer::new(StateSnapshot::new(), Vec::new()));
        let machine = PhaseStateMachine::new(config, connection, state)
            .unwrap()
            .with_producer(Arc::new(EchoProducer))
            .with_lifecycle(Arc::clone(&recorder) as Arc<dyn PhaseLifecycle>);
        (Arc::new(machine), peer, recorder)
    }

    fn sent_phases(peer: &mut ChannelPeer) -> Vec<i64> {
        peer.drain_sent()
            .iter()
            .map(|f| serde_json::from_str::<Value>(f).unwrap()["phase"].as_i64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_discrete_phase_acts_once() {
        let (machine, mut peer, recorder) = machine(config(&[])).await;

        machine.handle_transition(Some(3)).await;

        assert_eq!(machine.current_phase(), Some(3));
        assert!(!machine.in_continuous_mode());
        assert_eq!(sent_phases(&mut peer), [3]);
        assert_eq!(recorder.take(), ["start:3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_then_discrete_scenario() {
        let (machine, mut peer, recorder) = machine(config(&[6])).await;

        machine.handle_transition(Some(6)).await;
        assert_eq!(machine.current_phase(), Some(6));
        assert!(machine.in_continuous_mode());
        assert_eq!(machine.live_loops(), 1);
        assert_eq!(sent_phases(&mut peer), [6], "immediate action");

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(sent_phases(&mut peer), [6, 6], "two loop actions");

        machine.handle_transition(Some(7)).await;
        assert!(!machine.in_continuous_mode());
        assert_eq!(machine.live_loops(), 0);
        assert_eq!(recorder.take(), ["start:6", "end:6", "start:7"]);
        assert_eq!(sent_phases(&mut peer), [7]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(peer.drain_sent().is_empty(), "loop must not outlive its phase");
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_to_continuous_replaces_loop() {
        let (machine, mut peer, _recorder) = machine(config(&[6, 8])).await;

        machine.handle_transition(Some(6)).await;
        machine.handle_transition(Some(8)).await;
        assert_eq!(machine.live_loops(), 1);
        assert_eq!(sent_phases(&mut peer), [6, 8]);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sent_phases(&mut peer), [8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentering_same_continuous_phase_keeps_single_loop() {
        let (machine, mut peer, recorder) = machine(config(&[6])).await;

        machine.handle_transition(Some(6)).await;
        machine.handle_transition(Some(6)).await;
        assert_eq!(machine.live_loops(), 1);
        assert_eq!(recorder.take(), ["start:6", "end:6", "start:6"]);
        assert_eq!(sent_phases(&mut peer), [6, 6]);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sent_phases(&mut peer), [6], "exactly one loop fired");
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_alive_iff_current_phase_is_continuous() {
        let (machine, _peer, _recorder) = machine(config(&[6, 8])).await;
        let sequence = [
            Some(6),
            Some(6),
            Some(2),
            None,
            Some(8),
            Some(6),
            Some(8),
            Some(1),
            Some(8),
            None,
        ];

        for phase in sequence {
            machine.handle_transition(phase).await;
            tokio::time::sleep(Duration::from_secs(1)).await;

            assert_eq!(machine.current_phase(), phase);
            let expected = phase.is_some_and(|p| machine.config().is_continuous(p));
            assert_eq!(machine.in_continuous_mode(), expected, "after {phase:?}");
            assert_eq!(machine.live_loops(), usize::from(expected), "after {phase:?}");
        }
    }

    #[tokio::test]
    async fn test_null_phase_runs_end_hook_only() {
        let (machine, mut peer, recorder) = machine(config(&[])).await;

        machine.handle_transition(Some(2)).await;
        machine.handle_transition(None).await;

        assert_eq!(machine.current_phase(), None);
        assert_eq!(recorder.take(), ["start:2", "end:2"]);
        assert_eq!(sent_phases(&mut peer), [2]);
    }

    #[tokio::test]
    async fn test_failing_or_empty_producer_sends_nothing() {
        let (machine, mut peer, _recorder) = machine(config(&[])).await;

        assert!(!machine.execute_phase_action(13).await);
        assert!(!machine.execute_phase_action(99).await);
        assert!(peer.drain_sent().is_empty());
    }

    #[tokio::test]
    async fn test_override_takes_precedence() {
        let (machine, mut peer, _recorder) = machine(config(&[])).await;
        let machine = Arc::into_inner(machine).unwrap().with_overrides(
            PhaseOverrides::new().with(4, |phase, _state| async move {
                Ok(Some(json!({"type": "override", "phase": phase})))
            }),
        );
        let machine = Arc::new(machine);

        machine.handle_transition(Some(4)).await;
        let frame: Value = serde_json::from_str(&peer.drain_sent()[0]).unwrap();
        assert_eq!(frame["type"], "override");
    }

    #[tokio::test]
    async fn test_missing_producer_is_not_an_error() {
        let (transport, _peer) = ChannelTransport::pair();
        let connection = Arc::new(Connection::new(
            Arc::new(transport),
            Arc::new(LoginPayloadAuth),
            Value::Null,
        ));
        let state = Arc::new(StateSynchronizer::new(StateSnapshot::new(), Vec::new()));
        let machine = Arc::new(PhaseStateMachine::new(config(&[]), connection, state).unwrap());

        machine.handle_transition(Some(1)).await;
        assert_eq!(machine.current_phase(), Some(1));
    }

    #[tokio::test]
    async fn test_invalid_phase_value_causes_no_transition() {
        let (machine, _peer, recorder) = machine(config(&[])).await;
        let mut data = serde_json::Map::new();
        data.insert("phase".to_string(), json!({"nested": true}));

        let result = machine
            .on_transition_event(&Event::new("phase-transition", data))
            .await;

        assert!(result.is_err());
        assert_eq!(machine.current_phase(), None);
        assert!(recorder.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_loop_and_blocks_new_ones() {
        let (machine, mut peer, _recorder) = machine(config(&[6])).await;

        machine.handle_transition(Some(6)).await;
        machine.stop().await;
        machine.stop().await;
        assert_eq!(machine.live_loops(), 0);
        assert!(!machine.in_continuous_mode());

        machine.handle_transition(Some(6)).await;
        assert_eq!(machine.live_loops(), 0);
        let _ = peer.drain_sent();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(peer.drain_sent().is_empty());
    }

    #[test]
    fn test_inverted_delay_rejected_at_construction() {
        let (transport, _peer) = ChannelTransport::pair();
        let connection = Arc::new(Connection::new(
            Arc::new(transport),
            Arc::new(LoginPayloadAuth),
            Value::Null,
        ));
        let state = Arc::new(StateSynchronizer::new(StateSnapshot::new(), Vec::new()));
        let bad = PhaseConfig {
            min_delay_secs: 10,
            max_delay_secs: 1,
            ..PhaseConfig::default()
        };
        assert!(PhaseStateMachine::new(bad, connection, state).is_err());
    }
}
