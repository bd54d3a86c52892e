//! Standalone permission-bridge process, spawned once per session by
//! SubprocessDriver (spec.md §4.8). Speaks line-delimited JSON-RPC 2.0 over
//! stdio, registers exactly one tool (`approval_prompt`), and shares the
//! main process's on-disk Store. Never writes anything but protocol frames
//! to stdout — diagnostics go to a log file only.

use anyhow::{Context, Result};
use clap::Parser;
use memva::bridge;
use memva::config::db_path;
use memva::store::Store;
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "memva-permission-bridge")]
struct Args {
    #[arg(long)]
    session_id: String,

    #[arg(long, env = "MEMVA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    production: bool,
}

/// Parses args outside the async runtime so a missing `--session-id` exits
/// with the same code (1) as any other fatal init error (spec.md §6),
/// instead of clap's own usage-error exit code (2).
fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    tokio::runtime::Runtime::new()
        .context("building tokio runtime")?
        .block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);
    let _guard = setup_logging(&data_dir);

    tracing::info!(session_id = %args.session_id, "permission bridge starting");

    let store = Store::open(&db_path(&data_dir, args.production))
        .await
        .context("opening store")?;

    let mut shutdown = shutdown_signal();
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("permission bridge received shutdown signal");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        if let Some(response) = handle_line(&store, &args.session_id, &text).await {
                            let mut out = serde_json::to_string(&response)?;
                            out.push('\n');
                            stdout.write_all(out.as_bytes()).await?;
                            stdout.flush().await?;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(err = %e, "error reading stdin");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!("permission bridge exiting");
    Ok(())
}

async fn handle_line(store: &Store, session_id: &str, line: &str) -> Option<Value> {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(err = %e, "unparseable request line");
            return None;
        }
    };

    let id = request.get("id").cloned();
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");

    // Notifications (no `id`) never get a response, per JSON-RPC 2.0.
    let id = id?;

    let result = match method {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "memva-permission-bridge", "version": env!("CARGO_PKG_VERSION")},
        }),
        "tools/list" => json!({
            "tools": [{
                "name": "approval_prompt",
                "description": "Request human approval before running a tool.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "tool_name": {"type": "string"},
                        "input": {"type": "object"},
                        "tool_use_id": {"type": "string"},
                    },
                    "required": ["tool_name", "input"],
                },
            }]
        }),
        "tools/call" => {
            let params = request.get("params").cloned().unwrap_or(Value::Null);
            if params.get("name").and_then(Value::as_str) != Some("approval_prompt") {
                return Some(json!({
                    "jsonrpc": "2.0", "id": id,
                    "error": {"code": -32601, "message": format!("unknown tool: {method}")},
                }));
            }
            let tool_args = params.get("arguments").cloned().unwrap_or(Value::Null);
            let decision = bridge::handle_approval_prompt(store, session_id, &tool_args).await;
            json!({"content": [{"type": "text", "text": decision.to_string()}]})
        }
        other => {
            return Some(json!({
                "jsonrpc": "2.0", "id": id,
                "error": {"code": -32601, "message": format!("method not found: {other}")},
            }));
        }
    };

    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")).join(".memva")
}

/// Logs to a daily-rolling file only — stdout is reserved for JSON-RPC
/// frames (spec.md §4.8).
fn setup_logging(data_dir: &std::path::Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = data_dir.join("logs");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("warn: could not create log directory '{}': {e} — logging disabled", log_dir.display());
        return None;
    }
    let appender = tracing_appender::rolling::daily(&log_dir, "permission-bridge.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("MEMVA_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_writer(non_blocking)
        .compact()
        .init();
    Some(guard)
}

#[cfg(unix)]
fn shutdown_signal() -> impl std::future::Future<Output = ()> {
    use tokio::signal::unix::{signal, SignalKind};
    async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
}

#[cfg(not(unix))]
fn shutdown_signal() -> impl std::future::Future<Output = ()> {
    async move {
        let _ = tokio::signal::ctrl_c().await;
    }
}
