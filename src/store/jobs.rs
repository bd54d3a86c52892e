use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: String,
    #[sqlx(rename = "type")]
    pub job_type: String,
    pub data: String,
    pub status: String,
    pub priority: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub scheduled_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
    pub result: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    pub fn data_json(&self) -> Value {
        serde_json::from_str(&self.data).unwrap_or(Value::Null)
    }
}

#[derive(Clone)]
pub struct JobRepo {
    pool: SqlitePool,
}

impl JobRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        job_type: &str,
        data: &Value,
        priority: i64,
        max_attempts: i64,
        scheduled_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<JobRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let data_str = serde_json::to_string(data)?;
        sqlx::query(
            "INSERT INTO jobs (id, type, data, status, priority, attempts, max_attempts,
                                scheduled_at, created_at, updated_at)
             VALUES (?, ?, ?, 'pending', ?, 0, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(job_type)
        .bind(&data_str)
        .bind(priority)
        .bind(max_attempts)
        .bind(scheduled_at.map(|t| t.to_rfc3339()))
        .bind(&now_str)
        .bind(&now_str)
        .execute(&self.pool)
        .await?;

        self.get(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job not found after insert"))
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRow>> {
        Ok(sqlx::query_as(r#"SELECT id, type, data, status, priority, attempts, max_attempts,
                                     scheduled_at, started_at, completed_at, error, result,
                                     created_at, updated_at
                              FROM jobs WHERE id = ?"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Atomic claim: selects the pending job with max `priority` (tie-broken
    /// by oldest `created_at`) among those whose `scheduled_at` is null or
    /// due, and flips it to `running` in the same statement via a
    /// correlated subquery — so under N concurrent claimers exactly one
    /// `UPDATE` matches any given row (spec.md §4.4, invariant 3).
    pub async fn claim_next_pending(&self) -> Result<Option<JobRow>> {
        let now = Utc::now().to_rfc3339();
        let candidate: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM jobs
             WHERE status = 'pending' AND (scheduled_at IS NULL OR scheduled_at <= ?)
             ORDER BY priority DESC, created_at ASC
             LIMIT 1",
        )
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id,)) = candidate else {
            return Ok(None);
        };

        let result = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = ?, attempts = attempts + 1,
                              updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(&now)
        .bind(&id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Another worker claimed it between our SELECT and UPDATE.
            return Ok(None);
        }

        self.get(&id).await
    }

    pub async fn complete(&self, id: &str, result: Option<&Value>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result_str = result.map(serde_json::to_string).transpose()?;
        sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = ?, result = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&now)
        .bind(result_str)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// On failure: if `should_retry` and `attempts < max_attempts`, the job
    /// is reset to `pending` with `scheduled_at = now + retry_delay` (fixed
    /// delay, not exponential — spec.md §4.5); otherwise it becomes
    /// `failed` and terminal.
    pub async fn fail(
        &self,
        id: &str,
        error: &str,
        should_retry: bool,
        retry_delay_ms: u64,
    ) -> Result<()> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let job = self
            .get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {id} not found"))?;

        if should_retry && job.attempts < job.max_attempts {
            let scheduled = now + Duration::milliseconds(retry_delay_ms as i64);
            sqlx::query(
                "UPDATE jobs SET status = 'pending', scheduled_at = ?, error = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(scheduled.to_rfc3339())
            .bind(error)
            .bind(&now_str)
            .bind(id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE jobs SET status = 'failed', completed_at = ?, error = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(&now_str)
            .bind(error)
            .bind(&now_str)
            .bind(id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Sets `cancelled`. Running handlers cooperatively poll this to decide
    /// whether to abort (spec.md §5).
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE jobs SET status = 'cancelled', completed_at = ?, updated_at = ?
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The unique `session-runner` job in `{pending, running}` for a
    /// session, if any (enforces invariant 2: at most one active run).
    pub async fn get_active_for_session(&self, session_id: &str) -> Result<Option<JobRow>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"SELECT id, type, data, status, priority, attempts, max_attempts,
                      scheduled_at, started_at, completed_at, error, result,
                      created_at, updated_at
               FROM jobs
               WHERE type = 'session-runner' AND status IN ('pending', 'running')"#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .find(|r| r.data_json().get("sessionId").and_then(Value::as_str) == Some(session_id)))
    }

    /// Returns `true` if the job was found and is still in `{pending,
    /// running}` — i.e. its status reflects an in-flight or queued run.
    pub async fn is_active(&self, id: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(matches!(row, Some((status,)) if status == "pending" || status == "running"))
    }

    /// Deletes terminal rows whose `completed_at` is older than `days` ago
    /// (spec.md §4.4, §4.9).
    pub async fn cleanup_older_than(&self, days: i64) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let result = sqlx::query(
            "DELETE FROM jobs
             WHERE status IN ('completed', 'failed', 'cancelled') AND completed_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;
    use tempfile::tempdir;

    async fn repo() -> (JobRepo, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.db")).await.unwrap();
        (store.jobs(), dir)
    }

    #[tokio::test]
    async fn claim_exclusivity_under_concurrency() {
        let (repo, _dir) = repo().await;
        repo.create("session-runner", &json!({"sessionId": "s1"}), 0, 3, None)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move { repo.claim_next_pending().await.unwrap() }));
        }

        let mut claimed = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn priority_then_fifo_ordering() {
        let (repo, _dir) = repo().await;
        let low = repo.create("t", &json!({}), 0, 3, None).await.unwrap();
        let _high = repo.create("t", &json!({}), 5, 3, None).await.unwrap();

        let claimed = repo.claim_next_pending().await.unwrap().unwrap();
        assert_ne!(claimed.id, low.id);
        assert_eq!(claimed.priority, 5);
    }

    #[tokio::test]
    async fn fail_with_retry_reschedules_as_pending() {
        let (repo, _dir) = repo().await;
        let job = repo.create("t", &json!({}), 0, 3, None).await.unwrap();
        repo.claim_next_pending().await.unwrap();
        repo.fail(&job.id, "boom", true, 10).await.unwrap();

        let after = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(after.status, "pending");
        assert!(after.scheduled_at.is_some());
    }

    #[tokio::test]
    async fn fail_past_max_attempts_is_terminal() {
        let (repo, _dir) = repo().await;
        let job = repo.create("t", &json!({}), 0, 1, None).await.unwrap();
        repo.claim_next_pending().await.unwrap();
        repo.fail(&job.id, "boom", true, 10).await.unwrap();

        let after = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(after.status, "failed");
    }
}
