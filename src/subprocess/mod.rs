pub mod errors;

use crate::error::DriverError;
use errors::StderrFlags;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Flags and arguments for one subprocess launch (spec.md §4.6 "Launch
/// contract").
pub struct SpawnArgs {
    pub executable_name: String,
    pub project_path: PathBuf,
    pub prompt: String,
    pub resume_token: Option<String>,
    pub max_turns: u32,
    pub permission_mode: String,
    /// Tools auto-approved without a round-trip through the permission
    /// bridge.
    pub allowed_tools: Vec<String>,
    /// When set, the child is told where to find the permission-bridge
    /// executable and the session id it should tag permission rows with.
    pub permission_bridge: Option<PermissionBridgeLaunch>,
    pub timeout: Duration,
}

pub struct PermissionBridgeLaunch {
    pub bridge_executable_path: PathBuf,
    pub session_id: String,
}

/// Cooperative cancellation handle shared between the caller (SessionRunner)
/// and the driver's read loop. Encodes the "early abort" rule from
/// spec.md §4.6: a cancel requested before any assistant message has been
/// durably persisted is queued until the caller confirms the first
/// assistant event made it to storage, so a partial reply is never lost
/// silently. The driver itself has no notion of permission-mode or
/// exit-plan transitions — those are SessionRunner's orchestration; the
/// driver only needs to know *when* it is safe to kill the child.
#[derive(Clone, Default)]
pub struct CancelHandle {
    requested: Arc<AtomicBool>,
    assistant_persisted: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Called by the caller once the first assistant event of this run has
    /// been appended to the event store.
    pub fn mark_assistant_persisted(&self) {
        self.assistant_persisted.store(true, Ordering::SeqCst);
    }

    fn should_abort_now(&self) -> bool {
        self.requested.load(Ordering::SeqCst) && self.assistant_persisted.load(Ordering::SeqCst)
    }
}

pub enum DriverOutcome {
    Completed { messages: u64 },
    Cancelled { messages: u64 },
}

/// One item from the running subprocess: either a parsed stdout message, or
/// the terminal outcome once the child has exited / been cancelled /
/// timed out. The channel always ends with exactly one `Exited`.
pub enum DriverEvent {
    Message(Value),
    Exited(Result<DriverOutcome, DriverError>),
}

pub struct RunningProcess {
    pub events: mpsc::Receiver<DriverEvent>,
    pub cancel: CancelHandle,
}

/// Executable resolution policy (spec.md §4.6), first match wins:
/// 1. PATH lookup; 2. vendored module relative to the project; 3. a
/// globally installed module; 4. OS-specific common locations.
pub fn resolve_executable(name: &str, project_path: &Path) -> Result<PathBuf, DriverError> {
    if let Some(path) = which_on_path(name) {
        return Ok(path);
    }

    let vendored = project_path.join("node_modules").join(".bin").join(name);
    if vendored.is_file() {
        return Ok(vendored);
    }

    if let Some(home) = std::env::var_os("HOME") {
        let global = PathBuf::from(home).join(".npm-global").join("bin").join(name);
        if global.is_file() {
            return Ok(global);
        }
    }

    for candidate in common_locations(name) {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(DriverError::ExecutableNotFound(name.to_string()))
}

fn which_on_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        let candidate = dir.join(name);
        candidate.is_file().then_some(candidate)
    })
}

fn common_locations(name: &str) -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/local/bin").join(name),
        PathBuf::from("/opt/homebrew/bin").join(name),
        PathBuf::from("/usr/bin").join(name),
    ]
}

/// Spawn the assistant CLI and stream it. Resolution happens before the
/// background task starts so a missing executable fails synchronously.
pub async fn spawn(args: SpawnArgs) -> Result<RunningProcess, DriverError> {
    let executable = resolve_executable(&args.executable_name, &args.project_path)?;

    let mut cmd = tokio::process::Command::new(&executable);
    cmd.arg("--output-format").arg("stream-json");
    cmd.arg("--max-turns").arg(args.max_turns.to_string());
    cmd.arg("--permission-mode").arg(&args.permission_mode);
    if !args.allowed_tools.is_empty() {
        cmd.arg("--allowedTools").arg(args.allowed_tools.join(","));
    }
    if let Some(bridge) = &args.permission_bridge {
        cmd.arg("--permission-prompt-tool").arg("approval_prompt");
        cmd.arg("--mcp-bridge").arg(&bridge.bridge_executable_path);
        cmd.arg("--session-id").arg(&bridge.session_id);
    }
    if let Some(token) = &args.resume_token {
        cmd.arg("--resume").arg(token);
    }

    let mut child = cmd
        .current_dir(&args.project_path)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        let prompt = args.prompt.clone();
        tokio::spawn(async move {
            let _ = stdin.write_all(prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });
    }

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let resume_token_supplied = args.resume_token.is_some();
    let timeout = args.timeout;

    let (tx, rx) = mpsc::channel(64);
    let cancel = CancelHandle::new();
    let cancel_for_task = cancel.clone();

    tokio::spawn(async move {
        let stderr_flags = Arc::new(tokio::sync::Mutex::new(StderrFlags::default()));
        let stderr_task = tokio::spawn(drain_stderr(stderr, stderr_flags.clone()));

        let outcome = read_loop(&mut child, stdout, &cancel_for_task, &tx, timeout).await;

        stderr_task.abort();
        let flags = stderr_flags.lock().await.clone();

        let final_outcome = match outcome {
            Ok(outcome) => Ok(outcome),
            Err(ReadLoopError::Exited { success, messages }) => {
                if success {
                    Ok(DriverOutcome::Completed { messages })
                } else if let Some(resume_err) =
                    errors::classify_resume_failure(success, messages, resume_token_supplied, &flags)
                {
                    Err(resume_err)
                } else if let Some(stderr_err) = flags.classify() {
                    Err(stderr_err)
                } else {
                    Err(DriverError::Io(std::io::Error::other(
                        "subprocess exited with a non-zero status",
                    )))
                }
            }
            Err(ReadLoopError::ContextLimit(text)) => Err(DriverError::ContextLimit(text)),
            Err(ReadLoopError::Timeout) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                Err(DriverError::Timeout)
            }
            Err(ReadLoopError::Io(e)) => Err(DriverError::Io(e)),
        };

        let _ = tx.send(DriverEvent::Exited(final_outcome)).await;
    });

    Ok(RunningProcess { events: rx, cancel })
}

enum ReadLoopError {
    Exited { success: bool, messages: u64 },
    ContextLimit(String),
    Timeout,
    Io(std::io::Error),
}

async fn read_loop(
    child: &mut tokio::process::Child,
    stdout: tokio::process::ChildStdout,
    cancel: &CancelHandle,
    tx: &mpsc::Sender<DriverEvent>,
    timeout: Duration,
) -> Result<DriverOutcome, ReadLoopError> {
    let mut lines = BufReader::new(stdout).lines();
    let mut messages: u64 = 0;
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        tokio::select! {
            biased;

            _ = tokio::time::sleep_until(deadline) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Err(ReadLoopError::Timeout);
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        let value: Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(err = %e, line = %text, "unparseable subprocess message");
                                continue;
                            }
                        };
                        debug!(message = %value, "subprocess message");

                        if let Some(err) = errors::classify_result_message(&value) {
                            let DriverError::ContextLimit(text) = err else { unreachable!() };
                            let _ = child.kill().await;
                            let _ = child.wait().await;
                            return Err(ReadLoopError::ContextLimit(text));
                        }

                        messages += 1;
                        if tx.send(DriverEvent::Message(value)).await.is_err() {
                            // Receiver dropped — caller went away, tear down the child.
                            let _ = child.kill().await;
                            let _ = child.wait().await;
                            return Err(ReadLoopError::Exited { success: false, messages });
                        }

                        if cancel.should_abort_now() {
                            let _ = child.kill().await;
                            let _ = child.wait().await;
                            return Ok(DriverOutcome::Cancelled { messages });
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return Err(ReadLoopError::Io(e)),
                }
            }
        }
    }

    let status = child.wait().await.map_err(ReadLoopError::Io)?;
    Err(ReadLoopError::Exited { success: status.success(), messages })
}

async fn drain_stderr(stderr: tokio::process::ChildStderr, flags: Arc<tokio::sync::Mutex<StderrFlags>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "subprocess_stderr", "{}", line);
        flags.lock().await.observe_line(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_executable_finds_path_entry() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("fake-claude");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let original_path = std::env::var_os("PATH");
        std::env::set_var("PATH", dir.path());
        let resolved = resolve_executable("fake-claude", dir.path());
        if let Some(p) = original_path {
            std::env::set_var("PATH", p);
        }
        assert_eq!(resolved.unwrap(), exe);
    }

    #[test]
    fn resolve_executable_missing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("PATH", "");
        let result = resolve_executable("definitely-not-a-real-binary", dir.path());
        assert!(matches!(result, Err(DriverError::ExecutableNotFound(_))));
    }
}
