use std::sync::Arc;
use std::time::Duration;

use ledger_store::{EntityKind, Record, RecordDraft, RecordPatch, RowStore, StoreError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::diagnostics::DiagnosticEvent;
use crate::error::{SyncError, SyncResult, WriteOp};
use crate::fetch::{FetchTrigger, Refresher};
use crate::state::ConnectionState;

/// Remote writes followed by optimistic local patches.
///
/// In polling mode every successful write is followed by one reconciliation fetch after
/// `reconcile_delay`; with a live channel the push event does that job.
pub struct MutationCoordinator {
    rows: Arc<dyn RowStore>,
    table: String,
    owner_id: String,
    kind: EntityKind,
    refresher: Arc<Refresher>,
    state: watch::Receiver<ConnectionState>,
    reconcile_delay: Duration,
    cancel: CancellationToken,
}

impl MutationCoordinator {
    pub fn new(
        rows: Arc<dyn RowStore>,
        kind: EntityKind,
        refresher: Arc<Refresher>,
        state: watch::Receiver<ConnectionState>,
        reconcile_delay: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let label = refresher.label();
        Self {
            rows,
            table: label.table.clone(),
            owner_id: label.owner_id.clone(),
            kind,
            refresher,
            state,
            reconcile_delay,
            cancel,
        }
    }

    pub async fn create(&self, draft: RecordDraft) -> SyncResult<Record> {
        self.ensure_open()?;
        let record = self
            .rows
            .insert(&self.table, draft.into_new_record(self.owner_id.clone(), self.kind))
            .await
            .map_err(|err| self.failed(WriteOp::Create, err))?;
        self.refresher.data().prepend(record.clone());
        self.applied(WriteOp::Create, &record.id);
        Ok(record)
    }

    pub async fn update(&self, id: &str, patch: RecordPatch) -> SyncResult<Record> {
        self.ensure_open()?;
        let record = self
            .rows
            .update(&self.table, id, patch)
            .await
            .map_err(|err| self.failed(WriteOp::Update, err))?;
        self.refresher.data().replace(record.clone());
        self.applied(WriteOp::Update, id);
        Ok(record)
    }

    /// Deleting an id the session does not hold still issues the remote delete.
    pub async fn delete(&self, id: &str) -> SyncResult<()> {
        self.ensure_open()?;
        self.rows
            .delete(&self.table, id)
            .await
            .map_err(|err| self.failed(WriteOp::Delete, err))?;
        self.refresher.data().remove(id);
        self.applied(WriteOp::Delete, id);
        Ok(())
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::SessionClosed);
        }
        Ok(())
    }

    fn failed(&self, op: WriteOp, source: StoreError) -> SyncError {
        self.refresher.report(DiagnosticEvent::MutationFailed {
            op,
            error: source.to_string(),
        });
        SyncError::Write { op, source }
    }

    fn applied(&self, op: WriteOp, record_id: &str) {
        self.refresher.report(DiagnosticEvent::MutationApplied {
            op,
            record_id: record_id.to_string(),
        });
        if *self.state.borrow() != ConnectionState::Polling {
            return;
        }

        let delay = self.reconcile_delay;
        self.refresher
            .report(DiagnosticEvent::ReconcileScheduled { op, delay });
        let refresher = Arc::clone(&self.refresher);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => refresher.request(FetchTrigger::Reconcile),
            }
        });
    }
}
