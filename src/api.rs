//! The three external interfaces this daemon exposes beyond its own job
//! queue (spec.md §5): enqueueing a run, stopping one, and deciding a
//! pending permission request. Kept thin and free of transport concerns —
//! `src/ipc/mod.rs` is the only caller.

use crate::error::CoreError;
use crate::store::events::NewEvent;
use crate::store::Store;
use crate::worker::JobWorker;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct Api {
    store: Store,
    worker: Arc<JobWorker>,
}

impl Api {
    pub fn new(store: Store, worker: Arc<JobWorker>) -> Self {
        Self { store, worker }
    }

    /// Enqueue a `session-runner` job. Fails with `ActiveJobExists` if the
    /// session already has one in flight (spec.md §8, invariant 2).
    pub async fn enqueue_run(&self, session_id: &str, prompt: &str, user_id: Option<&str>) -> anyhow::Result<Value> {
        let trimmed = prompt.trim();
        if trimmed.is_empty() {
            return Err(CoreError::Validation("prompt must not be empty".to_string()).into());
        }

        if self.store.sessions().get(session_id).await?.is_none() {
            return Err(CoreError::NotFound(format!("session {session_id}")).into());
        }

        if self.store.jobs().get_active_for_session(session_id).await?.is_some() {
            return Err(CoreError::ActiveJobExists { session_id: session_id.to_string() }.into());
        }

        let job = self
            .store
            .jobs()
            .create(
                "session-runner",
                &json!({"sessionId": session_id, "prompt": trimmed, "userId": user_id}),
                0,
                3,
                None,
            )
            .await?;

        Ok(json!({"jobId": job.id, "sessionId": session_id}))
    }

    /// Idempotent: appends a synthetic `user_cancelled` marker event and
    /// cancels the active job, if any.
    pub async fn stop_run(&self, session_id: &str) -> anyhow::Result<Value> {
        let Some(session) = self.store.sessions().get(session_id).await? else {
            return Err(CoreError::NotFound(format!("session {session_id}")).into());
        };

        let thread_head = self.store.events().latest_for_session(session_id).await?.map(|e| e.uuid);
        self.store
            .events()
            .append(NewEvent {
                uuid: Uuid::new_v4().to_string(),
                memva_session_id: session_id.to_string(),
                external_session_id: String::new(),
                event_type: "user_cancelled".to_string(),
                parent_uuid: thread_head,
                is_sidechain: false,
                cwd: session.project_path.clone(),
                project_name: crate::session_runner::project_name_of(&session.project_path),
                data: json!({"type": "user_cancelled"}),
                visible: true,
            })
            .await?;

        self.store.sessions().set_claude_status(session_id, "completed").await?;

        if let Some(job) = self.store.jobs().get_active_for_session(session_id).await? {
            self.store.jobs().cancel(&job.id).await?;
        }

        Ok(json!({"sessionId": session_id, "stopped": true}))
    }

    /// Decide a pending permission request. On deny, appends a synthetic
    /// `tool_result` event and either cancels the active job immediately
    /// (no further pending permissions for the session) or after a short
    /// delay, to let the assistant observe the denial (spec.md §4.8).
    pub async fn decide_permission(&self, request_id: &str, decision: &str) -> anyhow::Result<Value> {
        let existing = self
            .store
            .permissions()
            .get(request_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("permission request {request_id}")))?;

        if !self.store.permissions().can_answer(&existing) {
            return Err(CoreError::NoLongerAnswerable(format!(
                "permission request {request_id} is no longer pending or has expired"
            ))
            .into());
        }
        if let Some(tool_use_id) = &existing.tool_use_id {
            if self.store.events().has_tool_result_for(&existing.session_id, tool_use_id).await? {
                return Err(CoreError::NoLongerAnswerable(format!(
                    "permission request {request_id} already has a recorded tool result"
                ))
                .into());
            }
        }

        let row = self.store.permissions().decide(request_id, decision).await?;

        if decision == "deny" {
            if let Some(tool_use_id) = &row.tool_use_id {
                if let Some(assistant_event) = self
                    .store
                    .events()
                    .find_assistant_event_with_tool_use_id(&row.session_id, tool_use_id)
                    .await?
                {
                    self.store
                        .events()
                        .append(NewEvent {
                            uuid: Uuid::new_v4().to_string(),
                            memva_session_id: row.session_id.clone(),
                            external_session_id: String::new(),
                            event_type: "user".to_string(),
                            parent_uuid: Some(assistant_event.uuid.clone()),
                            is_sidechain: false,
                            cwd: String::new(),
                            project_name: String::new(),
                            data: json!({
                                "type": "user",
                                "message": {
                                    "role": "user",
                                    "content": [{
                                        "type": "tool_result",
                                        "tool_use_id": tool_use_id,
                                        "content": "User denied request",
                                        "is_error": true,
                                    }]
                                }
                            }),
                            visible: true,
                        })
                        .await?;
                }
            }

            let remaining_pending = self
                .store
                .permissions()
                .list(&crate::store::permissions::PermissionFilter {
                    session_id: Some(row.session_id.clone()),
                    status: Some("pending".to_string()),
                    ..Default::default()
                })
                .await?;

            let session_id = row.session_id.clone();
            let worker_store = self.store.clone();
            if remaining_pending.is_empty() {
                if let Some(job) = self.store.jobs().get_active_for_session(&session_id).await? {
                    self.store.jobs().cancel(&job.id).await?;
                }
                self.store.sessions().set_claude_status(&session_id, "completed").await?;
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    if let Ok(Some(job)) = worker_store.jobs().get_active_for_session(&session_id).await {
                        let _ = worker_store.jobs().cancel(&job.id).await;
                    }
                });
            }
        }

        Ok(json!({"id": row.id, "status": row.status}))
    }

    pub fn worker(&self) -> &Arc<JobWorker> {
        &self.worker
    }
}
