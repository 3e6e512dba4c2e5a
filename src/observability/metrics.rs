//! Prometheus metrics.
//!
//! Event types come from the game server, so their labels are sanitized
//! and the number of distinct values is capped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::AgentsError;

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Maximum length of a label value.
const MAX_LABEL_LEN: usize = 64;

/// Maximum number of distinct event-type labels.
const MAX_EVENT_LABELS: usize = 128;

/// Bucket for event types past [`MAX_EVENT_LABELS`].
const OVERFLOW_LABEL: &str = "__other__";

static SEEN_EVENT_LABELS: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Installs the global recorder.
///
/// With `Some(port)` an HTTP scrape endpoint listens on `127.0.0.1:<port>`;
/// otherwise metrics are only recorded in-process. A second call is a no-op.
///
/// # Errors
///
/// Returns `AgentsError::Io` if the recorder or listener cannot be installed.
pub fn init_metrics(port: Option<u16>) -> Result<(), AgentsError> {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        tracing::debug!("metrics already initialized, skipping");
        return Ok(());
    }
    port.map_or_else(
        || PrometheusBuilder::new().install_recorder().map(|_| ()),
        |p| {
            PrometheusBuilder::new()
                .with_http_listener(([127, 0, 0, 1], p))
                .install()
        },
    )
    .map_err(|e| AgentsError::Io(std::io::Error::other(e.to_string())))?;

    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        "econagents_events_total",
        "Routable events received, by event type"
    );
    describe_counter!("econagents_actions_total", "Action payloads sent, by mode");
    describe_counter!(
        "econagents_phase_transitions_total",
        "Phase transitions handled"
    );
    describe_gauge!("econagents_sessions_active", "Sessions currently connected");
    describe_gauge!(
        "econagents_continuous_loops_active",
        "Continuous phase loops currently running"
    );
    describe_counter!(
        "econagents_callable_failures_total",
        "Hook, handler and action failures, by stage"
    );
}

/// Replaces characters outside `[A-Za-z0-9_-]` and truncates.
#[must_use]
pub fn sanitize_label(raw: &str) -> String {
    raw.chars()
        .take(MAX_LABEL_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn event_label(event_type: &str) -> String {
    let label = sanitize_label(event_type);
    let Ok(mut seen) = SEEN_EVENT_LABELS.lock() else {
        return OVERFLOW_LABEL.to_owned();
    };
    if seen.contains(&label) {
        return label;
    }
    if seen.len() >= MAX_EVENT_LABELS {
        return OVERFLOW_LABEL.to_owned();
    }
    seen.insert(label.clone());
    label
}

/// Records a routable event.
pub fn record_event(event_type: &str) {
    counter!("econagents_events_total", "event_type" => event_label(event_type)).increment(1);
}

/// Records a sent action; `mode` is `"discrete"` or `"continuous"`.
pub fn record_action(mode: &'static str) {
    counter!("econagents_actions_total", "mode" => mode).increment(1);
}

/// Records a phase transition.
pub fn record_phase_transition() {
    counter!("econagents_phase_transitions_total").increment(1);
}

/// Records a failed hook, handler or action.
pub fn record_callable_failure(stage: &'static str) {
    counter!("econagents_callable_failures_total", "stage" => stage).increment(1);
}

/// Marks one more session as connected.
pub fn session_started() {
    gauge!("econagents_sessions_active").increment(1.0);
}

/// Marks one session as disconnected.
pub fn session_stopped() {
    gauge!("econagents_sessions_active").decrement(1.0);
}

/// Sets the number of live continuous loops.
#[allow(clippy::cast_precision_loss)]
pub fn set_continuous_loops(count: usize) {
    gauge!("econagents_continuous_loops_active").set(count as f64);
}
