use crate::config::{DefaultSettings, SubprocessConfig};
use crate::error::DriverError;
use crate::store::events::NewEvent;
use crate::store::settings::ResolvedSettings;
use crate::store::Store;
use crate::subprocess::{self, DriverEvent, DriverOutcome, PermissionBridgeLaunch, SpawnArgs};
use crate::worker::{JobHandler, JobOutcome};
use crate::store::jobs::JobRow;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

/// The `session-runner` job handler: drives one SubprocessDriver run per
/// job, persisting each stdout message as an Event and orchestrating the
/// two mid-run transitions (spec.md §4.7).
pub struct SessionRunnerHandler {
    store: Store,
    subprocess_config: SubprocessConfig,
    default_settings: DefaultSettings,
    permission_bridge_executable: PathBuf,
}

impl SessionRunnerHandler {
    pub fn new(
        store: Store,
        subprocess_config: SubprocessConfig,
        default_settings: DefaultSettings,
        permission_bridge_executable: PathBuf,
    ) -> Self {
        Self {
            store,
            subprocess_config,
            default_settings,
            permission_bridge_executable,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct JobPayload {
    #[serde(rename = "sessionId")]
    session_id: String,
    prompt: String,
    #[serde(rename = "userId")]
    user_id: Option<String>,
    /// Set to `false` for synthetic continuation prompts so the initial
    /// event they seed is not shown in the user-facing transcript.
    #[serde(default)]
    visible: Option<bool>,
}

enum Transition {
    Permission(String),
    ExitPlan,
}

#[derive(Default)]
struct TransitionState {
    /// Armed by the permission-mode poller; cleared (and promoted to
    /// `pending`) the next time an `assistant` event is persisted.
    permission_armed: Option<String>,
    pending: Option<Transition>,
}

#[async_trait]
impl JobHandler for SessionRunnerHandler {
    async fn handle(&self, job: &JobRow, _cancelled: Arc<AtomicBool>) -> JobOutcome {
        let payload: JobPayload = match serde_json::from_value(job.data_json()) {
            Ok(p) => p,
            Err(e) => {
                return JobOutcome::Failed { error: format!("invalid job payload: {e}"), should_retry: false }
            }
        };

        match self.run(job, payload).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id = %job.id, err = %e, "session-runner handler failed");
                JobOutcome::Failed { error: e.to_string(), should_retry: false }
            }
        }
    }
}

impl SessionRunnerHandler {
    async fn run(&self, job: &JobRow, payload: JobPayload) -> anyhow::Result<JobOutcome> {
        let session_id = payload.session_id.clone();
        let prompt = payload.prompt.trim().to_string();

        let Some(session) = self.store.sessions().get(&session_id).await? else {
            return Ok(JobOutcome::Failed { error: format!("session {session_id} not found"), should_retry: false });
        };

        self.store.sessions().set_claude_status(&session_id, "processing").await?;

        let resolved = self.store.settings().get_or_init(&self.default_settings).await?;
        let resolved = ResolvedSettings::merge(session.settings.as_deref(), &DefaultSettings {
            max_turns: resolved.max_turns,
            permission_mode: resolved.permission_mode,
        });
        let launched_permission_mode = resolved.permission_mode.clone();

        let project_name = project_name_of(&session.project_path);

        let existing = self.store.events().list_for_session(&session_id).await?;
        let (mut thread_head, resume_token) = if existing.is_empty() {
            let seeded = self
                .store
                .events()
                .append(NewEvent {
                    uuid: Uuid::new_v4().to_string(),
                    memva_session_id: session_id.clone(),
                    external_session_id: String::new(),
                    event_type: "user".to_string(),
                    parent_uuid: None,
                    is_sidechain: false,
                    cwd: session.project_path.clone(),
                    project_name: project_name.clone(),
                    data: json!({"type": "user", "message": {"role": "user", "content": prompt}}),
                    visible: payload.visible.unwrap_or(true),
                })
                .await?;
            (seeded.uuid, None)
        } else {
            let last = existing.last().expect("checked non-empty above");
            (last.uuid.clone(), session.resume_token.clone())
        };

        let spawn_args = SpawnArgs {
            executable_name: self.subprocess_config.executable_name.clone(),
            project_path: PathBuf::from(&session.project_path),
            prompt: prompt.clone(),
            resume_token,
            max_turns: resolved.max_turns,
            permission_mode: resolved.permission_mode.clone(),
            allowed_tools: Vec::new(),
            permission_bridge: Some(PermissionBridgeLaunch {
                bridge_executable_path: self.permission_bridge_executable.clone(),
                session_id: session_id.clone(),
            }),
            timeout: Duration::from_secs(self.subprocess_config.timeout_secs),
        };

        let mut process = match subprocess::spawn(spawn_args).await {
            Ok(p) => p,
            Err(e) => return Ok(self.finish_driver_error(&session_id, e).await?),
        };

        let transition_state = Arc::new(Mutex::new(TransitionState::default()));
        let poller = tokio::spawn(Self::permission_transition_poller(
            self.store.clone(),
            job.id.clone(),
            session_id.clone(),
            launched_permission_mode,
            self.default_settings.clone(),
            transition_state.clone(),
            process.cancel.clone(),
        ));

        let mut messages_processed: u64 = 0;
        let mut first_assistant_seen = false;
        let mut had_clean_terminal_event = false;
        let mut final_outcome: Option<Result<DriverOutcome, DriverError>> = None;

        while let Some(event) = process.events.recv().await {
            match event {
                DriverEvent::Message(m) => {
                    messages_processed += 1;
                    if let Err(e) = self
                        .persist_message(
                            &session_id,
                            &project_name,
                            &session.project_path,
                            &mut thread_head,
                            &m,
                            &mut first_assistant_seen,
                            &mut had_clean_terminal_event,
                            &transition_state,
                            &process.cancel,
                        )
                        .await
                    {
                        warn!(job_id = %job.id, err = %e, "failed to persist subprocess message");
                    }
                }
                DriverEvent::Exited(outcome) => {
                    final_outcome = Some(outcome);
                    break;
                }
            }
        }

        poller.abort();

        let outcome = final_outcome
            .unwrap_or_else(|| Err(DriverError::Io(std::io::Error::other("subprocess channel closed unexpectedly"))));

        match outcome {
            Ok(DriverOutcome::Completed { .. }) => {
                self.store.sessions().set_claude_status(&session_id, "completed").await?;
                Ok(JobOutcome::Completed(Some(json!({
                    "success": true,
                    "sessionId": session_id,
                    "messagesProcessed": messages_processed,
                    "userId": payload.user_id,
                }))))
            }
            Ok(DriverOutcome::Cancelled { .. }) => {
                let pending = transition_state.lock().await.pending.take();
                match pending {
                    Some(Transition::Permission(mode)) => {
                        let continuation_prompt = format!(
                            "The user has changed your permissions mode to: {mode}. Please acknowledge this change and let the user know you're now operating in {mode} mode."
                        );
                        self.schedule_continuation(&session_id, &continuation_prompt, job, payload.user_id.clone())
                            .await?;
                        self.store.sessions().set_claude_status(&session_id, "processing").await?;
                        Ok(JobOutcome::Completed(Some(json!({
                            "success": true,
                            "sessionId": session_id,
                            "messagesProcessed": messages_processed,
                            "transition": true,
                        }))))
                    }
                    Some(Transition::ExitPlan) => {
                        self.schedule_continuation(&session_id, "Continue with your plan.", job, payload.user_id.clone())
                            .await?;
                        self.store.sessions().set_claude_status(&session_id, "processing").await?;
                        Ok(JobOutcome::Completed(Some(json!({
                            "success": true,
                            "sessionId": session_id,
                            "messagesProcessed": messages_processed,
                            "transition": true,
                        }))))
                    }
                    None => {
                        // Skip this if stop_run/decide_permission already finalized the
                        // session's status directly — their write already reflects the
                        // true outcome (e.g. "completed" for an intentional stop), and
                        // our own local `had_clean_terminal_event` flag only tracks
                        // messages streamed through this run, not events they wrote.
                        let already_finalized = self
                            .store
                            .sessions()
                            .get(&session_id)
                            .await?
                            .map(|s| s.claude_status != "processing")
                            .unwrap_or(false);
                        if !already_finalized {
                            let terminal_status = if had_clean_terminal_event { "completed" } else { "error" };
                            self.store.sessions().set_claude_status(&session_id, terminal_status).await?;
                        }
                        Ok(JobOutcome::Failed { error: "Job cancelled by user".to_string(), should_retry: false })
                    }
                }
            }
            Err(e) => Ok(self.finish_driver_error(&session_id, e).await?),
        }
    }

    async fn finish_driver_error(&self, session_id: &str, e: DriverError) -> anyhow::Result<JobOutcome> {
        self.store.sessions().set_claude_status(session_id, "error").await?;
        if matches!(e, DriverError::ResumeFailed(_)) {
            self.store.sessions().clear_resume_token(session_id).await?;
        }
        let should_retry = e.is_retriable();
        Ok(JobOutcome::Failed { error: e.to_string(), should_retry })
    }

    async fn schedule_continuation(
        &self,
        session_id: &str,
        prompt: &str,
        job: &JobRow,
        user_id: Option<String>,
    ) -> anyhow::Result<()> {
        self.store
            .jobs()
            .create(
                "session-runner",
                &json!({
                    "sessionId": session_id,
                    "prompt": prompt,
                    "userId": user_id,
                    "visible": false,
                }),
                job.priority,
                job.max_attempts,
                None,
            )
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_message(
        &self,
        session_id: &str,
        project_name: &str,
        project_path: &str,
        thread_head: &mut String,
        m: &Value,
        first_assistant_seen: &mut bool,
        had_clean_terminal_event: &mut bool,
        transition_state: &Arc<Mutex<TransitionState>>,
        cancel: &subprocess::CancelHandle,
    ) -> anyhow::Result<()> {
        let external_session_id = m.get("session_id").and_then(Value::as_str).unwrap_or("").to_string();
        let event_type = m.get("type").and_then(Value::as_str).unwrap_or("unknown").to_string();

        let row = self
            .store
            .events()
            .append(NewEvent {
                uuid: Uuid::new_v4().to_string(),
                memva_session_id: session_id.to_string(),
                external_session_id: external_session_id.clone(),
                event_type: event_type.clone(),
                parent_uuid: Some(thread_head.clone()),
                is_sidechain: false,
                cwd: project_path.to_string(),
                project_name: project_name.to_string(),
                data: m.clone(),
                visible: true,
            })
            .await?;
        *thread_head = row.uuid;

        if !external_session_id.is_empty() {
            if let Some(session) = self.store.sessions().get(session_id).await? {
                if session.resume_token.as_deref() != Some(external_session_id.as_str()) {
                    self.store.sessions().set_resume_token(session_id, &external_session_id).await?;
                }
            }
        }

        match event_type.as_str() {
            "result" => *had_clean_terminal_event = true,
            "user" => {
                if let Some((tool_use_id, is_error)) = extract_tool_result(m) {
                    *had_clean_terminal_event = true;
                    if !is_error {
                        if let Some(assistant_event) =
                            self.store.events().find_assistant_event_with_tool_use_id(session_id, &tool_use_id).await?
                        {
                            if tool_use_name(&assistant_event.data_json(), &tool_use_id).as_deref()
                                == Some("exit_plan_mode")
                            {
                                transition_state.lock().await.pending = Some(Transition::ExitPlan);
                                cancel.request();
                            }
                        }
                    }
                }
            }
            "assistant" => {
                if !*first_assistant_seen {
                    *first_assistant_seen = true;
                    cancel.mark_assistant_persisted();
                }
                let mut state = transition_state.lock().await;
                if let Some(mode) = state.permission_armed.take() {
                    state.pending = Some(Transition::Permission(mode));
                    drop(state);
                    cancel.request();
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Runs alongside the driver read loop, watching for a user-initiated
    /// cancel while the run is in flight. If the session's resolved
    /// `permissionMode` has changed since launch, the abort is deferred
    /// (armed) rather than requested immediately — see `persist_message`'s
    /// `assistant` arm, which releases it on the next assistant event.
    async fn permission_transition_poller(
        store: Store,
        job_id: String,
        session_id: String,
        launched_permission_mode: String,
        defaults: DefaultSettings,
        transition_state: Arc<Mutex<TransitionState>>,
        cancel: subprocess::CancelHandle,
    ) {
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;

            let job = match store.jobs().get(&job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(_) => continue,
            };
            if job.status != "cancelled" {
                continue;
            }

            let current_mode = match store.sessions().get(&session_id).await {
                Ok(Some(session)) => {
                    ResolvedSettings::merge(session.settings.as_deref(), &defaults).permission_mode
                }
                _ => launched_permission_mode.clone(),
            };

            if current_mode != launched_permission_mode {
                transition_state.lock().await.permission_armed = Some(current_mode);
            } else {
                cancel.request();
            }
            break;
        }
    }
}

pub(crate) fn project_name_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string()
}

/// Duck-typed lookup of a `tool_result` block in a `user` message: returns
/// `(tool_use_id, is_error)`.
fn extract_tool_result(m: &Value) -> Option<(String, bool)> {
    let content = m.get("message")?.get("content")?.as_array()?;
    content.iter().find_map(|block| {
        if block.get("type").and_then(Value::as_str) != Some("tool_result") {
            return None;
        }
        let tool_use_id = block.get("tool_use_id").and_then(Value::as_str)?.to_string();
        let is_error = block.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        Some((tool_use_id, is_error))
    })
}

/// Duck-typed lookup of a `tool_use` block's `name` by id in an assistant
/// event's stored `data`.
fn tool_use_name(data: &Value, tool_use_id: &str) -> Option<String> {
    let content = data.get("message")?.get("content")?.as_array()?;
    content.iter().find_map(|block| {
        if block.get("type").and_then(Value::as_str) == Some("tool_use")
            && block.get("id").and_then(Value::as_str) == Some(tool_use_id)
        {
            block.get("name").and_then(Value::as_str).map(str::to_string)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_tool_result_finds_matching_block() {
        let m = json!({
            "type": "user",
            "message": {"role": "user", "content": [{"type": "tool_result", "tool_use_id": "tu2", "is_error": false}]}
        });
        let (id, is_error) = extract_tool_result(&m).unwrap();
        assert_eq!(id, "tu2");
        assert!(!is_error);
    }

    #[test]
    fn extract_tool_result_ignores_non_tool_result_content() {
        let m = json!({"type": "user", "message": {"role": "user", "content": [{"type": "text", "text": "hi"}]}});
        assert!(extract_tool_result(&m).is_none());
    }

    #[test]
    fn tool_use_name_matches_by_id() {
        let data = json!({
            "message": {"content": [{"type": "tool_use", "id": "tu2", "name": "exit_plan_mode", "input": {}}]}
        });
        assert_eq!(tool_use_name(&data, "tu2").as_deref(), Some("exit_plan_mode"));
        assert_eq!(tool_use_name(&data, "tu9"), None);
    }

    #[test]
    fn project_name_of_takes_last_segment() {
        assert_eq!(project_name_of("/home/user/my-project"), "my-project");
        assert_eq!(project_name_of("relative"), "relative");
    }
}
