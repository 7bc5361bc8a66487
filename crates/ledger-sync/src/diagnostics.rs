//! Injectable telemetry for sync sessions.
//!
//! Sessions never log through globals; every observable step is reported to the
//! [`Diagnostics`] handed to the factory. [`TracingDiagnostics`] is the default,
//! [`SyncMetrics`] exports prometheus counters, [`RecordingDiagnostics`] keeps events
//! in memory for assertions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{debug, info, warn};

use crate::error::WriteOp;
use crate::event::ChangeOperation;
use crate::fetch::FetchTrigger;
use crate::state::{ConnectionState, FallbackReason};

/// Identifies the session an event came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionLabel {
    pub table: String,
    pub owner_id: String,
}

impl fmt::Display for SessionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.owner_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    ProbeCompleted {
        viable: bool,
        inconclusive: bool,
        reasons: Vec<String>,
    },
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
        reason: Option<FallbackReason>,
    },
    ChannelOpened {
        topic: String,
    },
    ChannelReleased {
        topic: String,
    },
    ChangeReceived {
        operation: ChangeOperation,
        record_id: String,
    },
    ChangeRejected {
        detail: String,
    },
    FetchStarted {
        trigger: FetchTrigger,
        generation: u64,
    },
    FetchCompleted {
        trigger: FetchTrigger,
        generation: u64,
        rows: usize,
        elapsed: Duration,
    },
    FetchDiscarded {
        trigger: FetchTrigger,
        generation: u64,
        applied: u64,
    },
    FetchFailed {
        trigger: FetchTrigger,
        error: String,
    },
    PollerStarted {
        interval: Duration,
        threshold: Duration,
    },
    PollerStopped,
    PollSkipped {
        since_last_fetch: Duration,
    },
    MutationApplied {
        op: WriteOp,
        record_id: String,
    },
    MutationFailed {
        op: WriteOp,
        error: String,
    },
    ReconcileScheduled {
        op: WriteOp,
        delay: Duration,
    },
    SessionClosed,
}

pub trait Diagnostics: Send + Sync {
    fn record(&self, session: &SessionLabel, event: &DiagnosticEvent);
}

/// Structured `tracing` output under the `ledger_sync` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn record(&self, session: &SessionLabel, event: &DiagnosticEvent) {
        match event {
            DiagnosticEvent::ProbeCompleted {
                viable,
                inconclusive,
                reasons,
            } => {
                info!(
                    target = "ledger_sync",
                    session = %session,
                    viable,
                    inconclusive,
                    reasons = ?reasons,
                    "connection probe finished"
                );
            }
            DiagnosticEvent::StateChanged { from, to, reason } => {
                if *to == ConnectionState::Polling {
                    warn!(
                        target = "ledger_sync",
                        session = %session,
                        from = %from,
                        reason = reason.map(FallbackReason::as_str).unwrap_or("none"),
                        "falling back to polling"
                    );
                } else {
                    info!(
                        target = "ledger_sync",
                        session = %session,
                        from = %from,
                        to = %to,
                        "connection state changed"
                    );
                }
            }
            DiagnosticEvent::ChannelOpened { topic } => {
                debug!(target = "ledger_sync", session = %session, topic = %topic, "channel opened");
            }
            DiagnosticEvent::ChannelReleased { topic } => {
                debug!(target = "ledger_sync", session = %session, topic = %topic, "channel released");
            }
            DiagnosticEvent::ChangeReceived {
                operation,
                record_id,
            } => {
                debug!(
                    target = "ledger_sync",
                    session = %session,
                    operation = operation.as_str(),
                    record_id = %record_id,
                    "change event received"
                );
            }
            DiagnosticEvent::ChangeRejected { detail } => {
                warn!(target = "ledger_sync", session = %session, detail = %detail, "ignoring change payload");
            }
            DiagnosticEvent::FetchStarted {
                trigger,
                generation,
            } => {
                debug!(
                    target = "ledger_sync",
                    session = %session,
                    trigger = trigger.as_str(),
                    generation,
                    "fetch started"
                );
            }
            DiagnosticEvent::FetchCompleted {
                trigger,
                generation,
                rows,
                elapsed,
            } => {
                debug!(
                    target = "ledger_sync",
                    session = %session,
                    trigger = trigger.as_str(),
                    generation,
                    rows,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "fetch applied"
                );
            }
            DiagnosticEvent::FetchDiscarded {
                trigger,
                generation,
                applied,
            } => {
                info!(
                    target = "ledger_sync",
                    session = %session,
                    trigger = trigger.as_str(),
                    generation,
                    applied,
                    "discarding stale fetch result"
                );
            }
            DiagnosticEvent::FetchFailed { trigger, error } => {
                warn!(
                    target = "ledger_sync",
                    session = %session,
                    trigger = trigger.as_str(),
                    error = %error,
                    "fetch failed"
                );
            }
            DiagnosticEvent::PollerStarted {
                interval,
                threshold,
            } => {
                info!(
                    target = "ledger_sync",
                    session = %session,
                    interval_ms = interval.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "poller started"
                );
            }
            DiagnosticEvent::PollerStopped => {
                debug!(target = "ledger_sync", session = %session, "poller stopped");
            }
            DiagnosticEvent::PollSkipped { since_last_fetch } => {
                debug!(
                    target = "ledger_sync",
                    session = %session,
                    since_last_fetch_ms = since_last_fetch.as_millis() as u64,
                    "poll tick skipped; data is fresh"
                );
            }
            DiagnosticEvent::MutationApplied { op, record_id } => {
                debug!(
                    target = "ledger_sync",
                    session = %session,
                    op = op.as_str(),
                    record_id = %record_id,
                    "optimistic patch applied"
                );
            }
            DiagnosticEvent::MutationFailed { op, error } => {
                warn!(
                    target = "ledger_sync",
                    session = %session,
                    op = op.as_str(),
                    error = %error,
                    "remote write failed"
                );
            }
            DiagnosticEvent::ReconcileScheduled { op, delay } => {
                debug!(
                    target = "ledger_sync",
                    session = %session,
                    op = op.as_str(),
                    delay_ms = delay.as_millis() as u64,
                    "reconciliation fetch scheduled"
                );
            }
            DiagnosticEvent::SessionClosed => {
                info!(target = "ledger_sync", session = %session, "session closed");
            }
        }
    }
}

/// Keeps every event; for tests and debugging views.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    events: Mutex<Vec<(SessionLabel, DiagnosticEvent)>>,
}

impl RecordingDiagnostics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn events_for(&self, table: &str) -> Vec<DiagnosticEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(label, _)| label.table == table)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&DiagnosticEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|(_, e)| predicate(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn record(&self, session: &SessionLabel, event: &DiagnosticEvent) {
        self.events.lock().push((session.clone(), event.clone()));
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutDiagnostics {
    sinks: Vec<Arc<dyn Diagnostics>>,
}

impl FanoutDiagnostics {
    pub fn new(sinks: Vec<Arc<dyn Diagnostics>>) -> Self {
        Self { sinks }
    }

    pub fn with(mut self, sink: Arc<dyn Diagnostics>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Diagnostics for FanoutDiagnostics {
    fn record(&self, session: &SessionLabel, event: &DiagnosticEvent) {
        for sink in &self.sinks {
            sink.record(session, event);
        }
    }
}

/// Prometheus counters registered into a caller-owned registry.
#[derive(Clone)]
pub struct SyncMetrics {
    transitions: IntCounterVec,
    fetches: IntCounterVec,
    mutations: IntCounterVec,
    poll_skips: IntCounterVec,
    changes: IntCounterVec,
}

impl SyncMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let transitions = IntCounterVec::new(
            Opts::new(
                "ledger_sync_state_transitions_total",
                "connection state transitions by table and target state",
            ),
            &["table", "to"],
        )?;
        let fetches = IntCounterVec::new(
            Opts::new(
                "ledger_sync_fetches_total",
                "full fetches by table, trigger and outcome",
            ),
            &["table", "trigger", "outcome"],
        )?;
        let mutations = IntCounterVec::new(
            Opts::new(
                "ledger_sync_mutations_total",
                "remote writes by table, operation and outcome",
            ),
            &["table", "op", "outcome"],
        )?;
        let poll_skips = IntCounterVec::new(
            Opts::new(
                "ledger_sync_poll_skips_total",
                "poll ticks skipped because data was fresh",
            ),
            &["table"],
        )?;
        let changes = IntCounterVec::new(
            Opts::new(
                "ledger_sync_change_events_total",
                "push change events by table and operation",
            ),
            &["table", "operation"],
        )?;
        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(fetches.clone()))?;
        registry.register(Box::new(mutations.clone()))?;
        registry.register(Box::new(poll_skips.clone()))?;
        registry.register(Box::new(changes.clone()))?;
        Ok(Self {
            transitions,
            fetches,
            mutations,
            poll_skips,
            changes,
        })
    }
}

impl Diagnostics for SyncMetrics {
    fn record(&self, session: &SessionLabel, event: &DiagnosticEvent) {
        let table = session.table.as_str();
        match event {
            DiagnosticEvent::StateChanged { to, .. } => {
                self.transitions.with_label_values(&[table, to.as_str()]).inc();
            }
            DiagnosticEvent::FetchCompleted { trigger, .. } => {
                self.fetches
                    .with_label_values(&[table, trigger.as_str(), "applied"])
                    .inc();
            }
            DiagnosticEvent::FetchDiscarded { trigger, .. } => {
                self.fetches
                    .with_label_values(&[table, trigger.as_str(), "discarded"])
                    .inc();
            }
            DiagnosticEvent::FetchFailed { trigger, .. } => {
                self.fetches
                    .with_label_values(&[table, trigger.as_str(), "failed"])
                    .inc();
            }
            DiagnosticEvent::MutationApplied { op, .. } => {
                self.mutations.with_label_values(&[table, op.as_str(), "ok"]).inc();
            }
            DiagnosticEvent::MutationFailed { op, .. } => {
                self.mutations
                    .with_label_values(&[table, op.as_str(), "error"])
                    .inc();
            }
            DiagnosticEvent::PollSkipped { .. } => {
                self.poll_skips.with_label_values(&[table]).inc();
            }
            DiagnosticEvent::ChangeReceived { operation, .. } => {
                self.changes
                    .with_label_values(&[table, operation.as_str()])
                    .inc();
            }
            _ => {}
        }
    }
}

/// Text exposition of everything in `registry`.
pub fn gather(registry: &Registry) -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        warn!(target = "ledger_sync", error = %err, "failed to encode metrics");
    }
    buffer
}
