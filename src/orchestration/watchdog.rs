//! Completion watchdog: turns per-worker done sentinels into events.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::mailbox::{DoneStatus, Mailbox};
use crate::{clog_debug, clog_error, clog_warn, Result};

const DEFAULT_INTERVAL: Duration = Duration::from_millis(3_000);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub worker: String,
    pub task_id: String,
    pub status: DoneStatus,
    pub summary: String,
}

#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn on_completion(&self, event: CompletionEvent) -> Result<()>;
}

/// Scans the done sentinels of every worker not yet handled.
///
/// A worker is marked handled before its sentinel is deleted and before the
/// handler runs, so a failing handler is never invoked twice for the same
/// sentinel.
pub struct Watchdog {
    mailbox: Mailbox,
    workers: Vec<String>,
    processed: Arc<Mutex<HashSet<String>>>,
    interval: Duration,
}

impl Watchdog {
    pub fn new(mailbox: Mailbox, workers: Vec<String>) -> Self {
        Self {
            mailbox,
            workers,
            processed: Arc::new(Mutex::new(HashSet::new())),
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One scan. Returns the number of events dispatched.
    pub async fn tick(&self, handler: &dyn CompletionHandler) -> usize {
        let mut dispatched = 0;
        for worker in &self.workers {
            if self.processed.lock().await.contains(worker) {
                continue;
            }
            let Some(done) = self.mailbox.read_done(worker).await else {
                continue;
            };
            self.processed.lock().await.insert(worker.clone());
            if let Err(e) = self.mailbox.delete_done(worker).await {
                clog_warn!("watchdog: could not remove done file of {}: {}", worker, e);
            }

            let event = CompletionEvent {
                worker: worker.clone(),
                task_id: done.task_id,
                status: done.status,
                summary: done.summary,
            };
            clog_debug!(
                "watchdog: {} finished task {} ({:?})",
                event.worker,
                event.task_id,
                event.status
            );
            if let Err(e) = handler.on_completion(event).await {
                clog_error!("watchdog: completion handler failed for {}: {}", worker, e);
            }
            dispatched += 1;
        }
        dispatched
    }

    pub async fn is_processed(&self, worker: &str) -> bool {
        self.processed.lock().await.contains(worker)
    }

    /// Run [`Watchdog::tick`] every interval until the handle is stopped.
    pub fn spawn(self, handler: Arc<dyn CompletionHandler>) -> WatchdogHandle {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let processed = self.processed.clone();

        clog_debug!(
            "Watchdog::spawn workers={} interval={:?}",
            self.workers.len(),
            self.interval
        );

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        clog_debug!("Watchdog cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        self.tick(handler.as_ref()).await;
                    }
                }
            }
        });

        WatchdogHandle {
            cancel,
            processed,
            task: Some(task),
        }
    }
}

/// Stops a spawned [`Watchdog`].
pub struct WatchdogHandle {
    cancel: CancellationToken,
    processed: Arc<Mutex<HashSet<String>>>,
    task: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    /// Watch `worker` again, e.g. after handing it another task.
    pub async fn rearm(&self, worker: &str) {
        self.processed.lock().await.remove(worker);
    }

    /// Stop and wait for the tick in flight, if any, to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                clog_warn!("watchdog task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
