use super::with_timeout;
use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub title: Option<String>,
    pub project_path: String,
    pub status: String,
    pub claude_status: String,
    pub resume_token: Option<String>,
    pub metadata: Option<String>,
    pub settings: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct SessionRepo {
    pool: SqlitePool,
}

impl SessionRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        project_path: &str,
        title: Option<&str>,
        settings: Option<&str>,
    ) -> Result<SessionRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO sessions (id, title, project_path, status, claude_status, settings, created_at, updated_at)
             VALUES (?, ?, ?, 'active', 'not_started', ?, ?, ?)",
        )
        .bind(&id)
        .bind(title)
        .bind(project_path)
        .bind(settings)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session not found after insert"))
    }

    pub async fn get(&self, id: &str) -> Result<Option<SessionRow>> {
        Ok(sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list(&self) -> Result<Vec<SessionRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM sessions ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    /// Move `claude_status` along the state machine in spec.md §4.7.
    /// Callers are responsible for only requesting valid transitions —
    /// this is a plain write, not a conditional one (unlike
    /// `claim_for_run`, which must be race-safe across job launches).
    pub async fn set_claude_status(&self, id: &str, status: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET claude_status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_status(&self, id: &str, status: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Update `resume_token` to a freshly observed value. Per invariant 5
    /// (resume-token monotonicity), this is only ever called with a value
    /// seen from the running subprocess, and never clears the token
    /// implicitly mid-run.
    pub async fn set_resume_token(&self, id: &str, resume_token: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET resume_token = ?, updated_at = ? WHERE id = ?")
            .bind(resume_token)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clear `resume_token` after a `ResumeFailed` error, so the next run
    /// starts fresh instead of repeatedly failing to resume a dead session.
    pub async fn clear_resume_token(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET resume_token = NULL, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_settings(&self, id: &str, settings: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET settings = ?, updated_at = ? WHERE id = ?")
            .bind(settings)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use tempfile::tempdir;

    async fn repo() -> (SessionRepo, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.db")).await.unwrap();
        (store.sessions(), dir)
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let (repo, _dir) = repo().await;
        let row = repo.create("/tmp/p", Some("title"), None).await.unwrap();
        assert_eq!(row.claude_status, "not_started");
        assert_eq!(row.status, "active");

        let fetched = repo.get(&row.id).await.unwrap().unwrap();
        assert_eq!(fetched.project_path, "/tmp/p");
    }

    #[tokio::test]
    async fn resume_token_updates_without_clearing_on_read() {
        let (repo, _dir) = repo().await;
        let row = repo.create("/tmp/p", None, None).await.unwrap();
        repo.set_resume_token(&row.id, "x1").await.unwrap();
        let fetched = repo.get(&row.id).await.unwrap().unwrap();
        assert_eq!(fetched.resume_token.as_deref(), Some("x1"));
    }
}
