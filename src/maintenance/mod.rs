use crate::store::jobs::JobRow;
use crate::store::Store;
use crate::worker::{JobHandler, JobOutcome};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

/// Interval between self-rescheduled maintenance runs (spec.md §4.9).
const RESCHEDULE_INTERVAL_SECS: i64 = 60 * 60;
/// Job rows older than this are reaped by `cleanup-old-jobs`.
const JOB_RETENTION_DAYS: i64 = 30;

/// Housekeeping job handler: expires overdue permission requests and prunes
/// old terminal job rows, then reschedules itself (spec.md §4.9). Mirrors
/// the teacher's own self-scheduling background task idiom.
pub struct MaintenanceHandler {
    store: Store,
}

impl MaintenanceHandler {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Enqueue the first maintenance job at daemon startup.
    pub async fn enqueue_startup_job(store: &Store) -> anyhow::Result<()> {
        store
            .jobs()
            .create("maintenance", &json!({"operation": "cleanup-expired-permissions"}), 0, 1, None)
            .await?;
        store
            .jobs()
            .create("maintenance", &json!({"operation": "cleanup-old-jobs"}), 0, 1, None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for MaintenanceHandler {
    async fn handle(&self, job: &JobRow, _cancelled: Arc<AtomicBool>) -> JobOutcome {
        let operation = job.data_json().get("operation").and_then(|v| v.as_str()).map(str::to_string);

        let result = match operation.as_deref() {
            Some("cleanup-expired-permissions") => self.store.permissions().expire_overdue().await.map(|n| json!({"expired": n})),
            Some("cleanup-old-jobs") => self.store.jobs().cleanup_older_than(JOB_RETENTION_DAYS).await.map(|n| json!({"deleted": n})),
            other => {
                return JobOutcome::Failed { error: format!("unknown maintenance operation: {other:?}"), should_retry: false }
            }
        };

        match result {
            Ok(payload) => {
                info!(job_id = %job.id, operation = ?operation, result = %payload, "maintenance run complete");
                if let Err(e) = self.reschedule(operation.as_deref().unwrap_or_default(), job).await {
                    tracing::warn!(err = %e, "failed to reschedule maintenance job");
                }
                JobOutcome::Completed(Some(payload))
            }
            Err(e) => JobOutcome::Failed { error: e.to_string(), should_retry: true },
        }
    }
}

impl MaintenanceHandler {
    async fn reschedule(&self, operation: &str, job: &JobRow) -> anyhow::Result<()> {
        let scheduled_at = chrono::Utc::now() + chrono::Duration::seconds(RESCHEDULE_INTERVAL_SECS);
        self.store
            .jobs()
            .create("maintenance", &json!({"operation": operation}), 0, job.max_attempts, Some(scheduled_at))
            .await?;
        Ok(())
    }
}
