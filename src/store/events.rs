use crate::error::CoreError;
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashMap;

/// One immutable event row, per spec.md §3.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub uuid: String,
    pub memva_session_id: String,
    pub external_session_id: String,
    pub event_type: String,
    pub timestamp: String,
    pub parent_uuid: Option<String>,
    pub is_sidechain: bool,
    pub cwd: String,
    pub project_name: String,
    pub data: String,
    pub visible: bool,
    /// SQLite's implicit rowid, selected explicitly as a stable tie-break
    /// for events that share a `timestamp` (insertion order within a run).
    pub seq: i64,
}

const EVENT_COLUMNS: &str = "uuid, memva_session_id, external_session_id, event_type, timestamp, \
     parent_uuid, is_sidechain, cwd, project_name, data, visible, rowid AS seq";

impl EventRow {
    pub fn data_json(&self) -> Value {
        serde_json::from_str(&self.data).unwrap_or(Value::Null)
    }
}

/// Fields the caller must supply to append an event; everything else
/// (`timestamp`, `seq`) is filled in on insert.
pub struct NewEvent {
    pub uuid: String,
    pub memva_session_id: String,
    pub external_session_id: String,
    pub event_type: String,
    pub parent_uuid: Option<String>,
    pub is_sidechain: bool,
    pub cwd: String,
    pub project_name: String,
    pub data: Value,
    pub visible: bool,
}

#[derive(Clone)]
pub struct EventRepo {
    pool: SqlitePool,
}

impl EventRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert an event. Fails with `Conflict` if `uuid` already exists
    /// (spec.md §4.2).
    pub async fn append(&self, event: NewEvent) -> Result<EventRow> {
        let now = Utc::now().to_rfc3339();
        let data_str = serde_json::to_string(&event.data)?;
        let result = sqlx::query(
            "INSERT INTO events
                (uuid, memva_session_id, external_session_id, event_type, timestamp,
                 parent_uuid, is_sidechain, cwd, project_name, data, visible)
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
             WHERE NOT EXISTS (SELECT 1 FROM events WHERE uuid = ?)",
        )
        .bind(&event.uuid)
        .bind(&event.memva_session_id)
        .bind(&event.external_session_id)
        .bind(&event.event_type)
        .bind(&now)
        .bind(&event.parent_uuid)
        .bind(event.is_sidechain)
        .bind(&event.cwd)
        .bind(&event.project_name)
        .bind(&data_str)
        .bind(event.visible)
        .bind(&event.uuid)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::Conflict(format!("event {} already exists", event.uuid)).into());
        }

        self.get(&event.uuid)
            .await?
            .ok_or_else(|| anyhow::anyhow!("event not found after insert"))
    }

    pub async fn get(&self, uuid: &str) -> Result<Option<EventRow>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE uuid = ?");
        Ok(sqlx::query_as(&sql)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Events for a session, ordered by `timestamp` ascending, stable by
    /// insertion order (`seq`, a rowid alias) on ties.
    pub async fn list_for_session(&self, memva_session_id: &str) -> Result<Vec<EventRow>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE memva_session_id = ? ORDER BY timestamp ASC, seq ASC"
        );
        Ok(sqlx::query_as(&sql)
            .bind(memva_session_id)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<EventRow>> {
        let sql =
            format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY timestamp DESC, seq DESC LIMIT ?");
        Ok(sqlx::query_as(&sql).bind(limit).fetch_all(&self.pool).await?)
    }

    /// The single assistant event whose `data.message.content[*]` contains
    /// a `tool_use` with the given id, or `None`. Used to find the event to
    /// parent a synthetic deny `tool_result` under (spec.md §4.8) and to
    /// detect the exit-plan transition (spec.md §4.7).
    pub async fn find_assistant_event_with_tool_use_id(
        &self,
        session_id: &str,
        tool_use_id: &str,
    ) -> Result<Option<EventRow>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE memva_session_id = ? AND event_type = 'assistant' ORDER BY timestamp ASC, seq ASC"
        );
        let candidates: Vec<EventRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;

        for row in candidates {
            let data = row.data_json();
            if event_contains_tool_use(&data, tool_use_id) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Whether a `tool_result` block for `tool_use_id` has already been
    /// recorded for this session — a permission decision naming a
    /// `tool_use_id` that was already answered this way is stale
    /// (spec.md §4.3 `canAnswer`).
    pub async fn has_tool_result_for(&self, session_id: &str, tool_use_id: &str) -> Result<bool> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE memva_session_id = ? AND event_type = 'user' ORDER BY timestamp ASC, seq ASC"
        );
        let candidates: Vec<EventRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(candidates.iter().any(|row| event_contains_tool_result(&row.data_json(), tool_use_id)))
    }

    /// Most recently appended event for a session — used as the thread
    /// head when a run resumes with existing history.
    pub async fn latest_for_session(&self, session_id: &str) -> Result<Option<EventRow>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE memva_session_id = ? ORDER BY timestamp DESC, seq DESC LIMIT 1"
        );
        Ok(sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?)
    }
}

/// Pure helper: group a list of events by `external_session_id`.
/// Used by read APIs that need to present events per assistant-side turn.
pub fn group_by_external_session_id(events: &[EventRow]) -> HashMap<String, Vec<&EventRow>> {
    let mut groups: HashMap<String, Vec<&EventRow>> = HashMap::new();
    for event in events {
        groups
            .entry(event.external_session_id.clone())
            .or_default()
            .push(event);
    }
    groups
}

/// Best-effort lookup of a `tool_use` block with the given id inside an
/// assistant event's `message.content` array. Tolerates any shape mismatch
/// per the design note on duck-typed message discrimination (spec.md §9) —
/// the core never strongly types the full assistant protocol.
fn event_contains_tool_use(data: &Value, tool_use_id: &str) -> bool {
    data.get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks.iter().any(|b| {
                b.get("type").and_then(Value::as_str) == Some("tool_use")
                    && b.get("id").and_then(Value::as_str) == Some(tool_use_id)
            })
        })
        .unwrap_or(false)
}

/// Same shape as `event_contains_tool_use`, but for a `tool_result` block
/// inside a `user` event's `message.content` array.
fn event_contains_tool_result(data: &Value, tool_use_id: &str) -> bool {
    data.get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks.iter().any(|b| {
                b.get("type").and_then(Value::as_str) == Some("tool_result")
                    && b.get("tool_use_id").and_then(Value::as_str) == Some(tool_use_id)
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;
    use tempfile::tempdir;
    use uuid::Uuid;

    async fn repo() -> (EventRepo, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.db")).await.unwrap();
        (store.events(), dir)
    }

    fn new_event(session_id: &str, event_type: &str, parent: Option<String>, data: Value) -> NewEvent {
        NewEvent {
            uuid: Uuid::new_v4().to_string(),
            memva_session_id: session_id.to_string(),
            external_session_id: String::new(),
            event_type: event_type.to_string(),
            parent_uuid: parent,
            is_sidechain: false,
            cwd: "/tmp/p".to_string(),
            project_name: "p".to_string(),
            data,
            visible: true,
        }
    }

    #[tokio::test]
    async fn chaining_is_preserved_in_timestamp_order() {
        let (repo, _dir) = repo().await;
        let e1 = repo
            .append(new_event("s1", "user", None, json!({"type": "user"})))
            .await
            .unwrap();
        let e2 = repo
            .append(new_event("s1", "assistant", Some(e1.uuid.clone()), json!({"type": "assistant"})))
            .await
            .unwrap();

        let all = repo.list_for_session("s1").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].uuid, e1.uuid);
        assert_eq!(all[1].parent_uuid.as_deref(), Some(e1.uuid.as_str()));
        assert_eq!(all[1].uuid, e2.uuid);
    }

    #[tokio::test]
    async fn duplicate_uuid_is_conflict() {
        let (repo, _dir) = repo().await;
        let uuid = Uuid::new_v4().to_string();
        let mut ev = new_event("s1", "user", None, json!({}));
        ev.uuid = uuid.clone();
        repo.append(ev).await.unwrap();

        let mut dup = new_event("s1", "user", None, json!({}));
        dup.uuid = uuid;
        let err = repo.append(dup).await.unwrap_err();
        assert!(err.to_string().contains("conflict"));
    }

    #[tokio::test]
    async fn finds_assistant_event_by_tool_use_id() {
        let (repo, _dir) = repo().await;
        let assistant = repo
            .append(new_event(
                "s1",
                "assistant",
                None,
                json!({
                    "message": {
                        "role": "assistant",
                        "content": [{"type": "tool_use", "id": "tu1", "name": "Bash", "input": {}}]
                    }
                }),
            ))
            .await
            .unwrap();

        let found = repo
            .find_assistant_event_with_tool_use_id("s1", "tu1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.uuid, assistant.uuid);

        let missing = repo
            .find_assistant_event_with_tool_use_id("s1", "tu2")
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
