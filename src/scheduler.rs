// =============================================================================
// Scheduler — owns every background task and stops them together
// =============================================================================
//
// Periodic jobs sleep `period ± jitter` between runs, with the offset drawn
// from the OS random source each time. A job that is running when shutdown
// is requested finishes its current run; no new run starts afterwards.
// `shutdown()` returns only once every task has exited.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::secure_random::secure_offset_ms;

pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Receiver that flips to `true` when shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run `job` forever, waiting `period ± jitter` before each run.
    pub fn spawn_periodic<F, Fut>(&self, name: &str, period: Duration, jitter: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown_signal();
        let task_name = name.to_string();
        let base_ms = period.as_millis() as i64;
        let handle = tokio::spawn(async move {
            debug!(task = %task_name, period_ms = base_ms, "periodic task started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let delay_ms = (base_ms + secure_offset_ms(jitter)).max(1) as u64;
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                        job().await;
                    }
                }
            }
            debug!(task = %task_name, "periodic task stopped");
        });
        self.tasks.lock().push((name.to_string(), handle));
    }

    /// Run a long-lived task that watches the shutdown signal itself.
    pub fn spawn<F, Fut>(&self, name: &str, task: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.shutdown_signal()));
        self.tasks.lock().push((name.to_string(), handle));
    }

    /// Signal shutdown and wait for every task to exit.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        info!(tasks = tasks.len(), "stopping scheduled tasks");
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(task = %name, error = %e, "task ended abnormally");
            }
        }
    }
}
