//! Full-list fetches and the single entry point that coalesces background triggers.

use std::sync::Arc;

use ledger_store::{OwnerFilter, QueryOrder, RowStore};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::diagnostics::{DiagnosticEvent, Diagnostics, SessionLabel};
use crate::error::{SyncError, SyncResult};
use crate::store::{DataStore, FetchApply};

const NOTICE_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchTrigger {
    Initial,
    PushEvent,
    PollTick,
    Reconcile,
    Refetch,
}

impl FetchTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchTrigger::Initial => "initial",
            FetchTrigger::PushEvent => "push_event",
            FetchTrigger::PollTick => "poll_tick",
            FetchTrigger::Reconcile => "reconcile",
            FetchTrigger::Refetch => "refetch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied { rows: usize },
    /// The result arrived after a newer fetch or after teardown and was dropped.
    Discarded,
}

/// Transient, user-facing report of a background fetch failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub table: String,
    pub trigger: FetchTrigger,
    pub message: String,
}

pub struct Refresher {
    rows: Arc<dyn RowStore>,
    table: String,
    filter: OwnerFilter,
    order: QueryOrder,
    data: Arc<DataStore>,
    label: SessionLabel,
    diagnostics: Arc<dyn Diagnostics>,
    wake: Notify,
    pending: Mutex<Option<FetchTrigger>>,
    notices: broadcast::Sender<Notice>,
}

impl Refresher {
    pub fn new(
        rows: Arc<dyn RowStore>,
        filter: OwnerFilter,
        data: Arc<DataStore>,
        label: SessionLabel,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        Self {
            rows,
            table: label.table.clone(),
            filter,
            order: QueryOrder::newest_first(),
            data,
            label,
            diagnostics,
            wake: Notify::new(),
            pending: Mutex::new(None),
            notices,
        }
    }

    pub fn data(&self) -> &Arc<DataStore> {
        &self.data
    }

    pub fn label(&self) -> &SessionLabel {
        &self.label
    }

    pub(crate) fn report(&self, event: DiagnosticEvent) {
        self.diagnostics.record(&self.label, &event);
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Queues a background fetch. Requests made while one is queued or running collapse
    /// into a single follow-up fetch.
    pub fn request(&self, trigger: FetchTrigger) {
        self.pending.lock().get_or_insert(trigger);
        self.wake.notify_one();
    }

    /// Runs background fetches until `cancel` fires.
    pub fn spawn_driver(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = this.wake.notified() => {}
                }
                let Some(trigger) = this.pending.lock().take() else {
                    continue;
                };
                if let Err(err) = this.fetch_now(trigger).await {
                    if !cancel.is_cancelled() {
                        let _ = this.notices.send(Notice {
                            table: this.table.clone(),
                            trigger,
                            message: err.to_string(),
                        });
                    }
                }
            }
        })
    }

    /// Fetches the owner's full row set and offers it to the data store.
    pub async fn fetch_now(&self, trigger: FetchTrigger) -> SyncResult<FetchOutcome> {
        let ticket = self.data.begin_fetch();
        self.report(DiagnosticEvent::FetchStarted {
            trigger,
            generation: ticket.generation,
        });

        let rows = match self.rows.query(&self.table, &self.filter, &self.order).await {
            Ok(rows) => rows,
            Err(err) => {
                self.data.fail_fetch(ticket);
                self.report(DiagnosticEvent::FetchFailed {
                    trigger,
                    error: err.to_string(),
                });
                return Err(SyncError::Fetch(err));
            }
        };

        let count = rows.len();
        match self.data.complete_fetch(ticket, rows) {
            FetchApply::Applied => {
                self.report(DiagnosticEvent::FetchCompleted {
                    trigger,
                    generation: ticket.generation,
                    rows: count,
                    elapsed: ticket.started.elapsed(),
                });
                Ok(FetchOutcome::Applied { rows: count })
            }
            FetchApply::Stale { applied } => {
                self.report(DiagnosticEvent::FetchDiscarded {
                    trigger,
                    generation: ticket.generation,
                    applied,
                });
                Ok(FetchOutcome::Discarded)
            }
            FetchApply::Closed => Ok(FetchOutcome::Discarded),
        }
    }
}
