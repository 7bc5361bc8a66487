use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::session::{SessionFactory, SessionSpec, SyncSession};

/// Keeps one session bound to whoever the identity watch currently names.
///
/// A changed owner tears the old session down before the new one opens; `None` (signed
/// out) leaves no session at all.
pub struct OwnerBoundSession {
    current: watch::Receiver<Option<Arc<SyncSession>>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl OwnerBoundSession {
    pub fn spawn(
        factory: SessionFactory,
        spec: SessionSpec,
        mut owner: watch::Receiver<Option<String>>,
    ) -> Self {
        let (tx, current) = watch::channel(None);
        let cancel = CancellationToken::new();

        let mut bound = Binding::default();
        bound.follow(&factory, &spec, owner.borrow_and_update().clone(), &tx);

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = owner.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let wanted = owner.borrow_and_update().clone();
                        bound.follow(&factory, &spec, wanted, &tx);
                    }
                }
            }
            bound.follow(&factory, &spec, None, &tx);
        });

        Self {
            current,
            cancel,
            task: Some(task),
        }
    }

    pub fn current(&self) -> Option<Arc<SyncSession>> {
        self.current.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<Arc<SyncSession>>> {
        self.current.clone()
    }

    /// Tears down the bound session and waits for the follower task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for OwnerBoundSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct Binding {
    owner: Option<String>,
    session: Option<Arc<SyncSession>>,
}

impl Binding {
    fn follow(
        &mut self,
        factory: &SessionFactory,
        spec: &SessionSpec,
        wanted: Option<String>,
        tx: &watch::Sender<Option<Arc<SyncSession>>>,
    ) {
        if wanted == self.owner {
            return;
        }
        if let Some(old) = self.session.take() {
            old.teardown();
        }
        info!(
            target = "ledger_sync",
            table = %spec.table_name,
            from = self.owner.as_deref().unwrap_or("-"),
            to = wanted.as_deref().unwrap_or("-"),
            "owner changed; rebinding session"
        );
        self.session = wanted
            .as_ref()
            .map(|owner_id| Arc::new(factory.open(spec.clone(), owner_id.clone())));
        self.owner = wanted;
        tx.send_replace(self.session.clone());
    }
}
