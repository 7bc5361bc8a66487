use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::diagnostics::DiagnosticEvent;
use crate::fetch::{FetchTrigger, Refresher};

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    running: Option<Running>,
    shut_down: bool,
}

/// Fixed-interval refresh timer. At most one timer task exists per scheduler.
#[derive(Default)]
pub struct PollingScheduler {
    slot: Mutex<Slot>,
}

impl PollingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts ticking every `interval`, first tick one interval from now. A tick only asks
    /// for a refresh when the last completed fetch is older than `threshold`.
    ///
    /// Returns false when a timer is already running or the scheduler was shut down.
    pub fn start(&self, interval: Duration, threshold: Duration, refresher: Arc<Refresher>) -> bool {
        let mut slot = self.slot.lock();
        if slot.shut_down || slot.running.is_some() {
            return false;
        }

        refresher.report(DiagnosticEvent::PollerStarted {
            interval,
            threshold,
        });
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match refresher.data().last_fetch_at() {
                    Some(last) if last.elapsed() <= threshold => {
                        refresher.report(DiagnosticEvent::PollSkipped {
                            since_last_fetch: last.elapsed(),
                        });
                    }
                    _ => refresher.request(FetchTrigger::PollTick),
                }
            }
        });
        slot.running = Some(Running { cancel, task });
        true
    }

    /// Clears the timer. Safe to call any number of times.
    pub fn stop(&self) -> bool {
        let running = self.slot.lock().running.take();
        match running {
            Some(running) => {
                running.cancel.cancel();
                running.task.abort();
                true
            }
            None => false,
        }
    }

    /// Stops the timer and refuses every later `start`.
    pub fn shutdown(&self) -> bool {
        let running = {
            let mut slot = self.slot.lock();
            slot.shut_down = true;
            slot.running.take()
        };
        match running {
            Some(running) => {
                running.cancel.cancel();
                running.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().running.is_some()
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
