//! Per-(entity kind, owner) sync sessions.
//!
//! A session probes the runtime, then either subscribes to the change feed or goes straight
//! to polling. The push path is supervised by a guard timer; any channel failure, or the
//! guard firing before the acknowledgement, moves the session to polling for good.

use std::sync::Arc;

use change_feed::{ChangeFeed, TopicFilter};
use ledger_store::{EntityKind, OwnerFilter, Record, RecordDraft, RecordPatch, RowStore};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::channel::{ChannelLease, ChannelSignal, SubscriptionChannel};
use crate::config::SyncConfig;
use crate::diagnostics::{DiagnosticEvent, Diagnostics, SessionLabel, TracingDiagnostics};
use crate::error::{SyncError, SyncResult};
use crate::event::ChangeEvent;
use crate::fetch::{FetchOutcome, FetchTrigger, Notice, Refresher};
use crate::mutation::MutationCoordinator;
use crate::probe::{ConnectionProbe, RuntimeEnvironment, StaticEnvironment};
use crate::scheduler::PollingScheduler;
use crate::state::{ConnectionState, ConnectionStateMachine, FallbackReason, Transition};
use crate::store::DataStore;

/// What a session syncs: a table, the column that scopes rows to an owner, and the row kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    pub table_name: String,
    pub owner_filter_field: String,
    pub kind: EntityKind,
}

impl SessionSpec {
    pub fn for_kind(kind: EntityKind) -> Self {
        Self {
            table_name: kind.table_name().to_string(),
            owner_filter_field: "owner_id".to_string(),
            kind,
        }
    }

    pub fn topic(&self) -> String {
        format!("ledger:{}", self.table_name)
    }
}

/// Opens sessions that share one row store, change feed, environment and config.
#[derive(Clone)]
pub struct SessionFactory {
    rows: Arc<dyn RowStore>,
    feed: Arc<dyn ChangeFeed>,
    environment: Arc<dyn RuntimeEnvironment>,
    config: SyncConfig,
    diagnostics: Arc<dyn Diagnostics>,
}

impl SessionFactory {
    pub fn new(rows: Arc<dyn RowStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            rows,
            feed,
            environment: Arc::new(StaticEnvironment::default()),
            config: SyncConfig::default(),
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }

    pub fn with_environment(mut self, environment: Arc<dyn RuntimeEnvironment>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config.normalized();
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Starts a session. Must be called from within a tokio runtime.
    pub fn open(&self, spec: SessionSpec, owner_id: impl Into<String>) -> SyncSession {
        let owner_id = owner_id.into();
        let label = SessionLabel {
            table: spec.table_name.clone(),
            owner_id: owner_id.clone(),
        };
        let cancel = CancellationToken::new();
        let refresher = Arc::new(Refresher::new(
            Arc::clone(&self.rows),
            OwnerFilter::new(spec.owner_filter_field.clone(), owner_id.clone()),
            Arc::new(DataStore::new()),
            label.clone(),
            Arc::clone(&self.diagnostics),
        ));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            label,
            config: self.config.clone(),
            machine: Mutex::new(ConnectionStateMachine::new()),
            state_tx,
            refresher: Arc::clone(&refresher),
            scheduler: PollingScheduler::new(),
            lease: Mutex::new(None),
            cancel: cancel.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
        });
        let mutations = MutationCoordinator::new(
            Arc::clone(&self.rows),
            spec.kind,
            Arc::clone(&refresher),
            state_rx,
            self.config.reconcile_delay,
            cancel.clone(),
        );

        refresher.spawn_driver(cancel);
        refresher.request(FetchTrigger::Initial);

        let viability =
            ConnectionProbe::new(self.environment.as_ref(), &self.config.extra_bad_signatures)
                .detect_viability(self.feed.as_ref());
        shared.report(DiagnosticEvent::ProbeCompleted {
            viable: viability.viable,
            inconclusive: viability.inconclusive,
            reasons: viability.reasons.clone(),
        });

        let begun = shared.machine.lock().begin(viability.viable);
        if let Some(transition) = begun {
            shared.publish(transition);
        }
        if viability.viable {
            shared.connect(Arc::clone(&self.feed), &spec, &owner_id);
        } else {
            shared.start_polling();
        }

        SyncSession {
            spec,
            owner_id,
            shared,
            mutations,
        }
    }

    /// One session per entity kind for `owner_id`.
    pub fn open_ledger(&self, owner_id: &str) -> LedgerSessions {
        LedgerSessions {
            transactions: self.open(SessionSpec::for_kind(EntityKind::Transaction), owner_id),
            incomes: self.open(SessionSpec::for_kind(EntityKind::Income), owner_id),
            expenses: self.open(SessionSpec::for_kind(EntityKind::Expense), owner_id),
        }
    }
}

pub struct LedgerSessions {
    pub transactions: SyncSession,
    pub incomes: SyncSession,
    pub expenses: SyncSession,
}

impl LedgerSessions {
    pub fn get(&self, kind: EntityKind) -> &SyncSession {
        match kind {
            EntityKind::Transaction => &self.transactions,
            EntityKind::Income => &self.incomes,
            EntityKind::Expense => &self.expenses,
        }
    }

    pub fn teardown(&self) {
        self.transactions.teardown();
        self.incomes.teardown();
        self.expenses.teardown();
    }
}

struct Shared {
    label: SessionLabel,
    config: SyncConfig,
    machine: Mutex<ConnectionStateMachine>,
    state_tx: watch::Sender<ConnectionState>,
    refresher: Arc<Refresher>,
    scheduler: PollingScheduler,
    lease: Mutex<Option<Arc<ChannelLease>>>,
    cancel: CancellationToken,
    diagnostics: Arc<dyn Diagnostics>,
}

impl Shared {
    fn report(&self, event: DiagnosticEvent) {
        self.diagnostics.record(&self.label, &event);
    }

    fn publish(&self, transition: Transition) {
        self.state_tx.send_replace(transition.to);
        self.report(DiagnosticEvent::StateChanged {
            from: transition.from,
            to: transition.to,
            reason: transition.reason,
        });
    }

    fn connect(self: &Arc<Self>, feed: Arc<dyn ChangeFeed>, spec: &SessionSpec, owner_id: &str) {
        let filter = TopicFilter::eq(spec.owner_filter_field.clone(), owner_id);
        let channel = match SubscriptionChannel::open(feed, &spec.topic(), &filter) {
            Ok(channel) => channel,
            Err(err) => {
                warn!(
                    target = "ledger_sync",
                    session = %self.label,
                    error = %err,
                    "channel subscribe failed"
                );
                self.fall_back(FallbackReason::SubscribeFailed);
                return;
            }
        };
        let lease = channel.lease();
        self.report(DiagnosticEvent::ChannelOpened {
            topic: lease.topic().to_string(),
        });
        *self.lease.lock() = Some(lease);

        let deadline = Instant::now() + self.config.guard_timeout;
        tokio::spawn(supervise(Arc::clone(self), channel, deadline));
    }

    fn acknowledge(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let transition = self.machine.lock().acknowledge();
        if let Some(transition) = transition {
            self.publish(transition);
        }
    }

    fn fall_back(&self, reason: FallbackReason) {
        if self.cancel.is_cancelled() {
            return;
        }
        let transition = self.machine.lock().fall_back(reason);
        let Some(transition) = transition else {
            return;
        };
        self.release_channel();
        self.publish(transition);
        self.start_polling();
    }

    fn start_polling(&self) {
        self.scheduler.start(
            self.config.poll_interval,
            self.config.poll_threshold,
            Arc::clone(&self.refresher),
        );
    }

    fn release_channel(&self) {
        let lease = self.lease.lock().take();
        if let Some(lease) = lease {
            if lease.release() {
                self.report(DiagnosticEvent::ChannelReleased {
                    topic: lease.topic().to_string(),
                });
            }
        }
    }

    fn on_change(&self, event: ChangeEvent) {
        if !event.concerns(&self.label.table, &self.label.owner_id) {
            return;
        }
        self.report(DiagnosticEvent::ChangeReceived {
            operation: event.operation(),
            record_id: event.record_id().to_string(),
        });
        self.refresher.request(FetchTrigger::PushEvent);
    }
}

async fn supervise(shared: Arc<Shared>, mut channel: SubscriptionChannel, deadline: Instant) {
    let guard = sleep_until(deadline);
    tokio::pin!(guard);
    let mut armed = true;

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = &mut guard, if armed => {
                shared.fall_back(FallbackReason::GuardExpired);
                break;
            }
            signal = channel.next() => match signal {
                ChannelSignal::Acknowledged => {
                    armed = false;
                    shared.acknowledge();
                }
                ChannelSignal::Change(event) => shared.on_change(event),
                ChannelSignal::Undecodable(detail) => {
                    shared.report(DiagnosticEvent::ChangeRejected { detail });
                }
                ChannelSignal::Failed(reason) => {
                    shared.fall_back(reason);
                    break;
                }
            },
        }
    }
}

/// A live session. Dropping it tears it down.
pub struct SyncSession {
    spec: SessionSpec,
    owner_id: String,
    shared: Arc<Shared>,
    mutations: MutationCoordinator,
}

impl SyncSession {
    pub fn spec(&self) -> &SessionSpec {
        &self.spec
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Current rows, newest first.
    pub fn records(&self) -> Vec<Record> {
        self.shared.refresher.data().records()
    }

    pub fn loading(&self) -> bool {
        self.shared.refresher.data().loading()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.machine.lock().state()
    }

    pub fn state_history(&self) -> Vec<ConnectionState> {
        self.shared.machine.lock().history().to_vec()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn watch_records(&self) -> watch::Receiver<Vec<Record>> {
        self.shared.refresher.data().subscribe()
    }

    /// Background fetch failures. Lagging receivers lose the oldest notices.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.shared.refresher.notices()
    }

    pub fn last_fetch_at(&self) -> Option<Instant> {
        self.shared.refresher.data().last_fetch_at()
    }

    pub fn has_live_channel(&self) -> bool {
        self.shared
            .lease
            .lock()
            .as_ref()
            .map_or(false, |lease| lease.is_live())
    }

    pub fn is_polling_active(&self) -> bool {
        self.shared.scheduler.is_running()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub async fn create(&self, draft: RecordDraft) -> SyncResult<Record> {
        self.mutations.create(draft).await
    }

    pub async fn update(&self, id: &str, patch: RecordPatch) -> SyncResult<Record> {
        self.mutations.update(id, patch).await
    }

    pub async fn delete(&self, id: &str) -> SyncResult<()> {
        self.mutations.delete(id).await
    }

    /// Fetches now, outside the background queue, and waits for the result.
    pub async fn refetch(&self) -> SyncResult<FetchOutcome> {
        if self.is_closed() {
            return Err(SyncError::SessionClosed);
        }
        self.shared.refresher.fetch_now(FetchTrigger::Refetch).await
    }

    /// Releases the channel and timer. In-flight fetches and writes finish but no longer
    /// touch the rows. Idempotent.
    pub fn teardown(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.cancel.cancel();
        if self.shared.scheduler.shutdown() {
            self.shared.report(DiagnosticEvent::PollerStopped);
        }
        self.shared.release_channel();
        self.shared.refresher.data().close();
        self.shared.report(DiagnosticEvent::SessionClosed);
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_for_kind_uses_entity_table() {
        let spec = SessionSpec::for_kind(EntityKind::Income);
        assert_eq!(spec.table_name, "incomes");
        assert_eq!(spec.owner_filter_field, "owner_id");
        assert_eq!(spec.topic(), "ledger:incomes");
    }
}
