use crate::error::CoreError;
use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PermissionRow {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub tool_use_id: Option<String>,
    pub input: String,
    pub status: String,
    pub decision: Option<String>,
    pub decided_at: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

impl PermissionRow {
    pub fn input_json(&self) -> Value {
        serde_json::from_str(&self.input).unwrap_or(Value::Null)
    }

    pub fn is_pending(&self) -> bool {
        self.status == "pending"
    }
}

#[derive(Default)]
pub struct PermissionFilter {
    pub session_id: Option<String>,
    pub status: Option<String>,
    pub id: Option<String>,
}

#[derive(Clone)]
pub struct PermissionRepo {
    pool: SqlitePool,
}

impl PermissionRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, session_id: &str, tool_name: &str, tool_use_id: Option<&str>, input: &Value) -> Result<PermissionRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now + Duration::hours(24);
        let input_str = serde_json::to_string(input)?;

        sqlx::query(
            "INSERT INTO permission_requests
                (id, session_id, tool_name, tool_use_id, input, status, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(&id)
        .bind(session_id)
        .bind(tool_name)
        .bind(tool_use_id)
        .bind(&input_str)
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("permission request not found after insert"))
    }

    pub async fn get(&self, id: &str) -> Result<Option<PermissionRow>> {
        Ok(sqlx::query_as("SELECT * FROM permission_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list(&self, filter: &PermissionFilter) -> Result<Vec<PermissionRow>> {
        // Kept as a simple in-memory filter over a full scan: this table is
        // small and bounded (pending rows expire within 24h), so a
        // dynamic-WHERE query builder would be more machinery than value.
        let all: Vec<PermissionRow> = sqlx::query_as(
            "SELECT * FROM permission_requests ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(all
            .into_iter()
            .filter(|r| filter.session_id.as_deref().map(|s| s == r.session_id).unwrap_or(true))
            .filter(|r| filter.status.as_deref().map(|s| s == r.status).unwrap_or(true))
            .filter(|r| filter.id.as_deref().map(|i| i == r.id).unwrap_or(true))
            .collect())
    }

    /// Atomic decide: only updates a row that is still `pending`. Returns
    /// `Conflict` otherwise (spec.md §4.3, invariant 4).
    pub async fn decide(&self, id: &str, decision: &str) -> Result<PermissionRow> {
        let status = match decision {
            "allow" => "approved",
            "deny" => "denied",
            other => return Err(CoreError::Validation(format!("invalid decision: {other}")).into()),
        };
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            "UPDATE permission_requests SET status = ?, decision = ?, decided_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status)
        .bind(decision)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let existing = self.get(id).await?;
            return match existing {
                None => Err(CoreError::NotFound(format!("permission request {id}")).into()),
                Some(_) => Err(CoreError::Conflict(format!("permission request {id} already decided")).into()),
            };
        }

        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("permission request {id} vanished after decide"))
    }

    /// `false` once a `tool_result` for `tool_use_id` already exists, or
    /// status is not `pending`, or `expires_at < now` (spec.md §4.3). The
    /// `tool_result`-exists check is the caller's responsibility since it
    /// requires the EventRepo; this checks the permission-row half.
    pub fn can_answer(&self, row: &PermissionRow) -> bool {
        if !row.is_pending() {
            return false;
        }
        let expires_at: chrono::DateTime<Utc> = match row.expires_at.parse() {
            Ok(t) => t,
            Err(_) => return false,
        };
        expires_at > Utc::now()
    }

    /// Sets overdue `pending` rows to `timeout` (spec.md §4.3, §4.9).
    pub async fn expire_overdue(&self) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE permission_requests SET status = 'timeout', decided_at = ?
             WHERE status = 'pending' AND expires_at < ?",
        )
        .bind(&now)
        .bind(&now)
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

    async fn repo() -> (PermissionRepo, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.db")).await.unwrap();
        (store.permissions(), dir)
    }

    #[tokio::test]
    async fn decide_is_terminal() {
        let (repo, _dir) = repo().await;
        let row = repo
            .create("s1", "Bash", Some("tu1"), &json!({"command": "ls"}))
            .await
            .unwrap();

        let decided = repo.decide(&row.id, "allow").await.unwrap();
        assert_eq!(decided.status, "approved");
        assert!(decided.decided_at.is_some());

        let err = repo.decide(&row.id, "deny").await.unwrap_err();
        assert!(err.to_string().contains("conflict"));
    }

    #[tokio::test]
    async fn decide_unknown_id_is_not_found() {
        let (repo, _dir) = repo().await;
        let err = repo.decide("nope", "allow").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
