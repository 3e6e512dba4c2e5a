//! Structured lifecycle event stream.
//!
//! Discrete, typed events emitted while sessions run. Events are
//! serialized as newline-delimited JSON (JSONL) with a monotonically
//! increasing sequence number so consumers can order lines written by
//! concurrent sessions.

use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Event variants
// ---------------------------------------------------------------------------

/// A discrete event in the life of a session.
///
/// Tagged with `"type"` when serialized.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum LifecycleEvent {
    /// A session connected and authenticated.
    SessionStarted {
        /// When the session started.
        timestamp: DateTime<Utc>,
        /// Agent the session belongs to.
        agent_id: String,
        /// Unique id of this session run.
        session_id: String,
        /// Transport type (e.g. `"websocket"`).
        transport: String,
    },

    /// A session ended.
    SessionStopped {
        /// When the session stopped.
        timestamp: DateTime<Utc>,
        /// Agent the session belongs to.
        agent_id: String,
        /// Human-readable stop reason.
        reason: String,
    },

    /// A routable event was received from the server.
    EventReceived {
        /// When the event arrived.
        timestamp: DateTime<Utc>,
        /// Receiving agent.
        agent_id: String,
        /// Server-assigned event type.
        event_type: String,
    },

    /// A phase was entered.
    PhaseEntered {
        /// When the transition happened.
        timestamp: DateTime<Utc>,
        /// Agent whose machine transitioned.
        agent_id: String,
        /// Phase entered.
        phase: i64,
        /// Whether the phase repeats actions.
        continuous: bool,
    },

    /// A phase was left.
    PhaseExited {
        /// When the phase ended.
        timestamp: DateTime<Utc>,
        /// Agent whose machine transitioned.
        agent_id: String,
        /// Phase left.
        phase: i64,
    },

    /// An action payload was sent.
    ActionSent {
        /// When the action was sent.
        timestamp: DateTime<Utc>,
        /// Sending agent.
        agent_id: String,
        /// Phase the action belongs to.
        phase: i64,
        /// Size of the serialized payload.
        bytes: usize,
    },

    /// Every session of a game run has finished.
    RunCompleted {
        /// When the run finished.
        timestamp: DateTime<Utc>,
        /// Number of sessions started.
        sessions: usize,
        /// Sessions that ended with an error.
        failed: usize,
    },
}

impl LifecycleEvent {
    /// Builds a [`LifecycleEvent::SessionStarted`] stamped now.
    #[must_use]
    pub fn session_started(agent_id: &str, session_id: &str, transport: &str) -> Self {
        Self::SessionStarted {
            timestamp: Utc::now(),
            agent_id: agent_id.to_owned(),
            session_id: session_id.to_owned(),
            transport: transport.to_owned(),
        }
    }

    /// Builds a [`LifecycleEvent::SessionStopped`] stamped now.
    #[must_use]
    pub fn session_stopped(agent_id: &str, reason: impl Into<String>) -> Self {
        Self::SessionStopped {
            timestamp: Utc::now(),
            agent_id: agent_id.to_owned(),
            reason: reason.into(),
        }
    }

    /// Builds a [`LifecycleEvent::EventReceived`] stamped now.
    #[must_use]
    pub fn event_received(agent_id: &str, event_type: &str) -> Self {
        Self::EventReceived {
            timestamp: Utc::now(),
            agent_id: agent_id.to_owned(),
            event_type: event_type.to_owned(),
        }
    }

    /// Builds a [`LifecycleEvent::PhaseEntered`] stamped now.
    #[must_use]
    pub fn phase_entered(agent_id: &str, phase: i64, continuous: bool) -> Self {
        Self::PhaseEntered {
            timestamp: Utc::now(),
            agent_id: agent_id.to_owned(),
            phase,
            continuous,
        }
    }

    /// Builds a [`LifecycleEvent::PhaseExited`] stamped now.
    #[must_use]
    pub fn phase_exited(agent_id: &str, phase: i64) -> Self {
        Self::PhaseExited {
            timestamp: Utc::now(),
            agent_id: agent_id.to_owned(),
            phase,
        }
    }

    /// Builds a [`LifecycleEvent::ActionSent`] stamped now.
    #[must_use]
    pub fn action_sent(agent_id: &str, phase: i64, bytes: usize) -> Self {
        Self::ActionSent {
            timestamp: Utc::now(),
            agent_id: agent_id.to_owned(),
            phase,
            bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct EventEnvelope {
    sequence: u64,
    #[serde(flatten)]
    event: LifecycleEvent,
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

/// Thread-safe, buffered JSONL event writer.
///
/// Serialization or I/O failures are dropped; a broken event sink never
/// stops a session.
pub struct EventEmitter {
    writer: Mutex<BufWriter<Box<dyn Write + Send>>>,
    sequence: AtomicU64,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EventEmitter {
    /// Creates an emitter that writes to `writer`.
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(BufWriter::new(writer)),
            sequence: AtomicU64::new(0),
        }
    }

    /// Creates an emitter that writes to stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Creates an emitter that discards everything.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(Box::new(std::io::sink()))
    }

    /// Creates an emitter that writes to a new file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::new(Box::new(file)))
    }

    /// Writes `event` as one JSONL line.
    pub fn emit(&self, event: LifecycleEvent) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let envelope = EventEnvelope { sequence, event };

        if let Ok(mut w) = self.writer.lock() {
            if let Ok(line) = serde_json::to_string(&envelope) {
                let _ = writeln!(w, "{line}");
                let _ = w.flush();
            }
        }
    }

    /// Number of events emitted so far.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use serde_json::Value;

    use super::*;

    /// In-memory writer for capturing emitter output in tests.
    #[derive(Clone, Default)]
    pub(crate) struct TestWriter(Arc<StdMutex<Vec<u8>>>);

    impl TestWriter {
        pub(crate) fn lines(&self) -> Vec<Value> {
            let buf = self.0.lock().unwrap();
            String::from_utf8_lossy(&buf)
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    impl Write for TestWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(LifecycleEvent::phase_entered("1", 6, true)).unwrap();
        assert_eq!(json["type"], "PhaseEntered");
        assert_eq!(json["phase"], 6);
        assert_eq!(json["continuous"], true);
        assert_eq!(json["agent_id"], "1");
    }

    #[test]
    fn test_emitter_writes_sequenced_jsonl() {
        let tw = TestWriter::default();
        let emitter = EventEmitter::new(Box::new(tw.clone()));

        emitter.emit(LifecycleEvent::session_started("1", "abc", "websocket"));
        emitter.emit(LifecycleEvent::event_received("1", "phase-transition"));
        emitter.emit(LifecycleEvent::session_stopped("1", "connection closed"));

        assert_eq!(emitter.event_count(), 3);
        let lines = tw.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["sequence"], 0);
        assert_eq!(lines[0]["type"], "SessionStarted");
        assert_eq!(lines[0]["transport"], "websocket");
        assert_eq!(lines[1]["event_type"], "phase-transition");
        assert_eq!(lines[2]["sequence"], 2);
        assert!(lines[2].get("event").is_none(), "envelope must be flat");
    }

    #[test]
    fn test_noop_emitter_counts_but_discards() {
        let emitter = EventEmitter::noop();
        emitter.emit(LifecycleEvent::action_sent("2", 3, 42));
        assert_eq!(emitter.event_count(), 1);
    }

    #[test]
    fn test_from_file_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let emitter = EventEmitter::from_file(&path).unwrap();
        emitter.emit(LifecycleEvent::phase_exited("1", 2));
        drop(emitter);

        let text = std::fs::read_to_string(&path).unwrap();
        let line: Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(line["type"], "PhaseExited");
    }
}
