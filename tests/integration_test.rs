//! Integration tests for the memvad JSON-RPC server. Spins up a real
//! daemon on a free port and exercises the external RPC surface end to end.

use futures_util::{SinkExt, StreamExt};
use memva::config::{DaemonConfig, DefaultSettings, JobWorkerConfig, SubprocessConfig};
use memva::ipc::event::EventBroadcaster;
use memva::maintenance::MaintenanceHandler;
use memva::store::Store;
use memva::worker::JobWorker;
use memva::{api::Api, AppContext};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

async fn start_test_daemon() -> (String, Arc<AppContext>, std::path::PathBuf) {
    let data_dir = tempfile::tempdir().unwrap().keep();
    let port = get_free_port();

    let config = DaemonConfig {
        data_dir: data_dir.clone(),
        port,
        log: "warn".into(),
        job_worker: JobWorkerConfig::default(),
        subprocess: SubprocessConfig::default(),
        default_settings: DefaultSettings::default(),
    };

    let store = Store::open(&data_dir.join("memva.db")).await.unwrap();
    let worker = Arc::new(JobWorker::new(store.clone(), config.job_worker.clone()));
    worker.clone().spawn();
    let api = Arc::new(Api::new(store.clone(), worker.clone()));

    let ctx = Arc::new(AppContext {
        config: Arc::new(config),
        store,
        broadcaster: Arc::new(EventBroadcaster::new()),
        worker,
        api,
        started_at: std::time::Instant::now(),
        auth_token: String::new(),
    });

    let ctx_server = ctx.clone();
    tokio::spawn(async move {
        memva::ipc::run(ctx_server).await.ok();
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let url = format!("ws://127.0.0.1:{}", ctx.config.port);
    (url, ctx, data_dir)
}

fn get_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn ws_rpc(url: &str, method: &str, params: Value) -> Value {
    let (mut ws, _) = connect_async(url).await.expect("ws connect failed");

    let request = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params});
    ws.send(Message::Text(serde_json::to_string(&request).unwrap())).await.unwrap();

    loop {
        let msg = ws.next().await.unwrap().unwrap();
        if let Message::Text(text) = msg {
            let v: Value = serde_json::from_str(&text).unwrap();
            if v.get("id").is_some() {
                return v;
            }
        }
    }
}

#[tokio::test]
async fn daemon_ping() {
    let (url, _ctx, _dir) = start_test_daemon().await;
    let resp = ws_rpc(&url, "daemon.ping", json!({})).await;
    assert_eq!(resp["result"]["pong"], true);
}

#[tokio::test]
async fn daemon_status_reports_port() {
    let (url, ctx, _dir) = start_test_daemon().await;
    let resp = ws_rpc(&url, "daemon.status", json!({})).await;
    assert_eq!(resp["result"]["port"], ctx.config.port);
    assert!(resp["result"]["version"].is_string());
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let (url, _ctx, _dir) = start_test_daemon().await;
    let resp = ws_rpc(&url, "no.such.method", json!({})).await;
    assert_eq!(resp["error"]["code"], -32601);
}

#[tokio::test]
async fn enqueue_run_requires_an_existing_session() {
    let (url, _ctx, _dir) = start_test_daemon().await;
    let resp = ws_rpc(&url, "enqueueRun", json!({"sessionId": "does-not-exist", "prompt": "hi"})).await;
    assert!(resp.get("error").is_some(), "expected an error for an unknown session: {resp:?}");
}

#[tokio::test]
async fn enqueue_run_rejects_a_second_active_job_for_the_same_session() {
    let (_url, ctx, _dir) = start_test_daemon().await;
    let session = ctx.store.sessions().create("/tmp/project", None, None).await.unwrap();

    let first = ctx.api.enqueue_run(&session.id, "do the thing", None).await;
    assert!(first.is_ok());

    let second = ctx.api.enqueue_run(&session.id, "do another thing", None).await;
    let err = second.unwrap_err();
    assert!(err.to_string().contains("active"), "expected an active-job conflict, got: {err}");
}

#[tokio::test]
async fn enqueue_run_rejects_blank_prompt() {
    let (_url, ctx, _dir) = start_test_daemon().await;
    let session = ctx.store.sessions().create("/tmp/project", None, None).await.unwrap();
    let err = ctx.api.enqueue_run(&session.id, "   ", None).await.unwrap_err();
    assert!(err.to_string().contains("empty"));
}

#[tokio::test]
async fn decide_permission_allow_flips_status() {
    let (_url, ctx, _dir) = start_test_daemon().await;
    let session = ctx.store.sessions().create("/tmp/project", None, None).await.unwrap();
    let request = ctx.store.permissions().create(&session.id, "Bash", Some("tu_1"), &json!({"command": "ls"})).await.unwrap();

    let result = ctx.api.decide_permission(&request.id, "allow").await.unwrap();
    assert_eq!(result["status"], "approved");
}

#[tokio::test]
async fn decide_permission_deny_completes_the_session_when_nothing_else_pending() {
    let (_url, ctx, _dir) = start_test_daemon().await;
    let session = ctx.store.sessions().create("/tmp/project", None, None).await.unwrap();
    ctx.store.sessions().set_claude_status(&session.id, "processing").await.unwrap();

    let request = ctx.store.permissions().create(&session.id, "Bash", Some("tu_1"), &json!({"command": "rm -rf /"})).await.unwrap();

    let result = ctx.api.decide_permission(&request.id, "deny").await.unwrap();
    assert_eq!(result["status"], "denied");

    let reloaded = ctx.store.sessions().get(&session.id).await.unwrap().unwrap();
    assert_eq!(reloaded.claude_status, "completed");
}

#[tokio::test]
async fn stop_run_is_idempotent_with_no_active_job() {
    let (_url, ctx, _dir) = start_test_daemon().await;
    let session = ctx.store.sessions().create("/tmp/project", None, None).await.unwrap();

    let result = ctx.api.stop_run(&session.id).await.unwrap();
    assert_eq!(result["stopped"], true);

    // Calling it again must still succeed — no active job to cancel.
    let result = ctx.api.stop_run(&session.id).await.unwrap();
    assert_eq!(result["stopped"], true);
}

#[tokio::test]
async fn maintenance_job_expires_overdue_permissions() {
    use memva::worker::{JobHandler, JobOutcome};
    use std::sync::atomic::AtomicBool;

    let (_url, ctx, _dir) = start_test_daemon().await;
    let session = ctx.store.sessions().create("/tmp/project", None, None).await.unwrap();
    let request = ctx.store.permissions().create(&session.id, "Bash", Some("tu_1"), &json!({"command": "ls"})).await.unwrap();

    // Force it overdue directly, bypassing the 24h default expiry window.
    sqlx::query("UPDATE permission_requests SET expires_at = '2000-01-01T00:00:00Z' WHERE id = ?")
        .bind(&request.id)
        .execute(&ctx.store.pool())
        .await
        .unwrap();

    let handler = MaintenanceHandler::new(ctx.store.clone());
    let job = ctx.store.jobs().create("maintenance", &json!({"operation": "cleanup-expired-permissions"}), 0, 1, None).await.unwrap();
    let outcome = handler.handle(&job, std::sync::Arc::new(AtomicBool::new(false))).await;
    assert!(matches!(outcome, JobOutcome::Completed(_)));

    let reloaded = ctx.store.permissions().get(&request.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, "timeout");
}
