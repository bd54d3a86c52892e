use crate::config::JobWorkerConfig;
use crate::store::jobs::JobRow;
use crate::store::Store;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Outcome a handler reports back to the worker loop once it is done with
/// a claimed job (spec.md §4.5: "a handler signals completion via the
/// callback with either an error or a result payload").
pub enum JobOutcome {
    Completed(Option<Value>),
    /// Failed, with whether the job queue should retry it (subject to
    /// `max_attempts`).
    Failed { error: String, should_retry: bool },
}

/// A registered handler for one job `type`. Mirrors the teacher's
/// `#[async_trait] trait Runner` shape (`session/runner.rs`), generalized
/// from subprocess control to generic job dispatch.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job to completion (or cooperative cancellation). `cancelled`
    /// is flipped by the worker when `JobStore::cancel` observes this job's
    /// id — handlers that run for a while should poll it.
    async fn handle(&self, job: &JobRow, cancelled: Arc<AtomicBool>) -> JobOutcome;
}

struct Registration {
    handler: Arc<dyn JobHandler>,
}

/// Polling worker pool: up to `concurrent` cooperative workers each loop
/// `claim_next_pending` → dispatch → report outcome (spec.md §4.5).
pub struct JobWorker {
    store: Store,
    config: JobWorkerConfig,
    handlers: HashMap<String, Registration>,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
}

impl JobWorker {
    pub fn new(store: Store, config: JobWorkerConfig) -> Self {
        Self {
            store,
            config,
            handlers: HashMap::new(),
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handler registration is exclusive per type; double registration
    /// fails (spec.md §4.5).
    pub fn register(&mut self, job_type: &str, handler: Arc<dyn JobHandler>) -> Result<()> {
        if self.handlers.contains_key(job_type) {
            anyhow::bail!("handler already registered for job type '{job_type}'");
        }
        self.handlers.insert(job_type.to_string(), Registration { handler });
        Ok(())
    }

    /// Spawn `concurrent` worker loops and return immediately; call
    /// `stop()` to request a graceful shutdown.
    pub fn spawn(self: Arc<Self>) {
        for worker_id in 0..self.config.concurrent {
            let this = self.clone();
            tokio::spawn(async move { this.run_worker_loop(worker_id).await });
        }
    }

    /// Signal all workers to finish their current job and exit; no new
    /// claims after the signal (spec.md §4.5).
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    async fn run_worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "job worker started");
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            match self.store.jobs().claim_next_pending().await {
                Ok(Some(job)) => self.dispatch(job).await,
                Ok(None) => {
                    let jitter = Duration::from_millis(100 + (worker_id as u64 * 37) % 150);
                    tokio::select! {
                        _ = tokio::time::sleep(jitter) => {}
                        _ = self.shutdown.notified() => break,
                    }
                }
                Err(e) => {
                    error!(worker_id, err = %e, "claim_next_pending failed");
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
        info!(worker_id, "job worker stopped");
    }

    async fn dispatch(&self, job: JobRow) {
        let Some(registration) = self.handlers.get(&job.job_type) else {
            warn!(job_type = %job.job_type, job_id = %job.id, "no handler registered for job type");
            let _ = self
                .store
                .jobs()
                .fail(&job.id, "no handler registered", false, 0)
                .await;
            return;
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel_poller = {
            let store = self.store.clone();
            let job_id = job.id.clone();
            let cancelled = cancelled.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    match store.jobs().is_active(&job_id).await {
                        Ok(true) => continue,
                        _ => {
                            cancelled.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            })
        };

        let outcome = registration.handler.handle(&job, cancelled.clone()).await;
        cancel_poller.abort();

        match outcome {
            JobOutcome::Completed(result) => {
                if let Err(e) = self.store.jobs().complete(&job.id, result.as_ref()).await {
                    error!(job_id = %job.id, err = %e, "failed to mark job completed");
                }
            }
            JobOutcome::Failed { error, should_retry } => {
                if let Err(e) = self
                    .store
                    .jobs()
                    .fail(&job.id, &error, should_retry, self.config.retry_delay_ms)
                    .await
                {
                    error!(job_id = %job.id, err = %e, "failed to mark job failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &JobRow, _cancelled: Arc<AtomicBool>) -> JobOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            JobOutcome::Completed(None)
        }
    }

    #[tokio::test]
    async fn registering_same_type_twice_fails() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.db")).await.unwrap();
        let mut worker = JobWorker::new(store, JobWorkerConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        worker
            .register("demo", Arc::new(CountingHandler { calls: calls.clone() }))
            .unwrap();
        let err = worker
            .register("demo", Arc::new(CountingHandler { calls }))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn worker_dispatches_claimed_job_to_handler() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.db")).await.unwrap();
        store
            .jobs()
            .create("demo", &json!({}), 0, 3, None)
            .await
            .unwrap();

        let mut worker = JobWorker::new(store.clone(), JobWorkerConfig { concurrent: 1, ..Default::default() });
        let calls = Arc::new(AtomicUsize::new(0));
        worker.register("demo", Arc::new(CountingHandler { calls: calls.clone() })).unwrap();
        let worker = Arc::new(worker);
        worker.clone().spawn();

        tokio::time::sleep(Duration::from_millis(500)).await;
        worker.stop();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
