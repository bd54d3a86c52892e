use crate::store::Store;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum time to wait for a human decision before giving up and denying
/// (spec.md §4.8): 24 hours, matching `PermissionRequest.expires_at`.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One `approval_prompt` tool invocation: insert a pending row, poll until
/// a human decides or the deadline passes, and return the JSON result the
/// assistant expects. Never returns an `Err` to the caller — on any
/// internal failure this degrades to a deny, per the "never throw to the
/// assistant" rule.
pub async fn handle_approval_prompt(store: &Store, session_id: &str, params: &Value) -> Value {
    match try_handle(store, session_id, params).await {
        Ok(result) => result,
        Err(e) => {
            warn!(err = %e, "approval_prompt failed, defaulting to deny");
            json!({"behavior": "deny", "message": e.to_string()})
        }
    }
}

async fn try_handle(store: &Store, session_id: &str, params: &Value) -> anyhow::Result<Value> {
    let tool_name = params
        .get("tool_name")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing tool_name"))?;
    let input = params.get("input").cloned().unwrap_or(Value::Null);
    let tool_use_id = params.get("tool_use_id").and_then(Value::as_str);

    let request = store.permissions().create(session_id, tool_name, tool_use_id, &input).await?;
    debug!(request_id = %request.id, tool_name, "permission request created, awaiting decision");

    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    loop {
        let row = store
            .permissions()
            .get(&request.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("permission request {} vanished", request.id))?;

        match row.status.as_str() {
            "approved" => return Ok(json!({"behavior": "allow"})),
            "denied" => {
                let message = row.decision.unwrap_or_else(|| "denied".to_string());
                return Ok(json!({"behavior": "deny", "message": message}));
            }
            "timeout" => return Ok(json!({"behavior": "deny", "message": "timed out awaiting a decision"})),
            _ => {}
        }

        if tokio::time::Instant::now() >= deadline {
            return Ok(json!({"behavior": "deny", "message": "timed out awaiting a decision"}));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
