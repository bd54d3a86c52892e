pub mod auth;
pub mod event;

use crate::AppContext;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Message},
};
use tracing::{debug, error, info, trace, warn};

// ─── Rate limiting ──────────────────────────────────────────────────────────

/// Max new WebSocket connections per IP per minute.
const MAX_CONNECTIONS_PER_MIN: usize = 10;
/// Max RPC requests per connection per second.
const MAX_RPC_PER_SEC: u32 = 100;

/// Per-IP connection rate tracker.
struct ConnectionRateLimiter {
    connections: HashMap<IpAddr, Vec<Instant>>,
}

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self { connections: HashMap::new() }
    }

    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - std::time::Duration::from_secs(60);

        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);

        if timestamps.len() >= MAX_CONNECTIONS_PER_MIN {
            return false;
        }
        timestamps.push(now);
        true
    }
}

/// Per-connection RPC rate tracker using a tumbling window (resets each second).
struct RpcRateLimiter {
    count: u32,
    window_start: Instant,
}

impl RpcRateLimiter {
    fn new() -> Self {
        Self { count: 0, window_start: Instant::now() }
    }

    fn check(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start).as_secs() >= 1 {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= MAX_RPC_PER_SEC
    }
}

/// Constant-time token comparison to prevent timing-based token oracle attacks.
fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// ─── JSON-RPC 2.0 types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;
const UNAUTHORIZED: i32 = -32004;
const SESSION_NOT_FOUND: i32 = -32001;
const CONFLICT: i32 = -32010;

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("127.0.0.1:{}", ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "IPC server listening (WebSocket + HTTP health on same port)");

    ctx.broadcaster.broadcast(
        "daemon.ready",
        json!({"version": env!("CARGO_PKG_VERSION"), "port": ctx.config.port}),
    );

    let conn_limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new()));

    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping IPC server");
                ctx.worker.stop();
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };

                {
                    let mut limiter = conn_limiter.lock().await;
                    if !limiter.check_and_record(peer.ip()) {
                        warn!(peer = %peer, "connection rate limit exceeded — rejecting");
                        drop(stream);
                        continue;
                    }
                }

                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("IPC server stopped");
    Ok(())
}

/// Respond to an HTTP `GET /health` request with a JSON status document.
/// The daemon shares one port for both WebSocket (JSON-RPC) and this plain
/// HTTP health endpoint so clients can check liveness without a WS library.
async fn handle_health_check(mut stream: tokio::net::TcpStream, ctx: &AppContext) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut req_buf = [0u8; 256];
    let _ = stream.read(&mut req_buf).await;

    let uptime_secs = ctx.started_at.elapsed().as_secs();
    let body = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime_secs,
        "port": ctx.config.port,
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Resolves when a shutdown signal is received: SIGTERM or Ctrl-C on Unix,
/// Ctrl-C only elsewhere.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    // Both a health check and a WebSocket upgrade start with "GET "; detect
    // the health check specifically by its literal path before handshaking.
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 12 && &peek_buf[..12] == b"GET /health " {
        return handle_health_check(stream, &ctx).await;
    }

    let ws_config = WebSocketConfig {
        max_message_size: Some(16 * 1024 * 1024),
        max_frame_size: Some(4 * 1024 * 1024),
        ..Default::default()
    };
    let ws = accept_async_with_config(stream, Some(ws_config)).await?;
    let (mut sink, mut stream) = ws.split();

    // The first message from every client must be a `daemon.auth` RPC call
    // carrying the correct token, stored at `{data_dir}/auth_token` (0600).
    let mut client_token = String::new();
    if !ctx.auth_token.is_empty() {
        let first = tokio::time::timeout(std::time::Duration::from_secs(10), stream.next()).await;

        let text = match first {
            Ok(Some(Ok(Message::Text(t)))) => t,
            _ => return Ok(()),
        };

        let req: RpcRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(_) => {
                let _ = sink.send(Message::Text(error_response(Value::Null, PARSE_ERROR, "Parse error"))).await;
                return Ok(());
            }
        };

        let id = req.id.clone().unwrap_or(Value::Null);

        if req.method != "daemon.auth" {
            let _ = sink
                .send(Message::Text(error_response(id, UNAUTHORIZED, "Unauthorized — send daemon.auth first")))
                .await;
            return Ok(());
        }

        let provided = req.params.as_ref().and_then(|p| p.get("token")).and_then(Value::as_str).unwrap_or_default();

        if !tokens_equal(provided, &ctx.auth_token) {
            let _ = sink.send(Message::Text(error_response(id, UNAUTHORIZED, "Unauthorized — invalid token"))).await;
            return Ok(());
        }

        client_token = provided.to_string();
        let resp = json!({"jsonrpc": "2.0", "id": id, "result": {"authenticated": true}});
        let _ = sink.send(Message::Text(resp.to_string())).await;
        debug!("client authenticated");
    }

    let mut broadcast_rx = ctx.broadcaster.subscribe();
    let mut rpc_limiter = RpcRateLimiter::new();

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !rpc_limiter.check() {
                            let resp = error_response(Value::Null, INTERNAL_ERROR, "RPC rate limit exceeded — max 100 req/sec");
                            if let Err(e) = sink.send(Message::Text(resp)).await {
                                warn!(err = %e, "send error");
                                break;
                            }
                            continue;
                        }
                        let response = dispatch_text(&text, &ctx, &client_token).await;
                        if let Err(e) = sink.send(Message::Text(response)).await {
                            warn!(err = %e, "send error");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
            event = broadcast_rx.recv() => {
                match event {
                    Ok(json) => {
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            warn!(err = %e, "broadcast send error");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "broadcast lagged — slow client skipped events");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Dispatch a raw JSON-RPC text frame. `client_token` is re-verified on
/// every call so token rotation immediately invalidates in-flight
/// connections.
pub(crate) async fn dispatch_text(text: &str, ctx: &AppContext, client_token: &str) -> String {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => return error_response(Value::Null, PARSE_ERROR, "Parse error"),
    };

    if !ctx.auth_token.is_empty() && !tokens_equal(client_token, &ctx.auth_token) {
        return error_response(req.id.unwrap_or(Value::Null), UNAUTHORIZED, "Unauthorized — invalid or missing token");
    }

    if req.jsonrpc != "2.0" {
        return error_response(req.id.unwrap_or(Value::Null), INVALID_REQUEST, "Invalid Request");
    }

    let id = req.id.unwrap_or(Value::Null);
    let params = req.params.unwrap_or(Value::Null);

    trace!(method = %req.method, "rpc dispatch");

    let result = dispatch(&req.method, params, ctx).await;

    match result {
        Ok(value) => {
            let resp = RpcResponse { jsonrpc: "2.0", id, result: Some(value), error: None };
            serde_json::to_string(&resp).unwrap_or_default()
        }
        Err(e) => {
            let (code, msg) = classify_error(&e);
            error_response(id, code, &msg)
        }
    }
}

/// The daemon's entire external surface (SPEC_FULL.md §0): three methods
/// wired to `Api`, plus a liveness/status pair. Everything else this
/// system does is internal — enqueued jobs, subprocess management, the
/// permission bridge — and has no RPC surface of its own.
async fn dispatch(method: &str, params: Value, ctx: &AppContext) -> anyhow::Result<Value> {
    match method {
        "daemon.ping" => Ok(json!({"pong": true})),
        "daemon.status" => Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeSecs": ctx.started_at.elapsed().as_secs(),
            "port": ctx.config.port,
        })),
        "enqueueRun" => {
            let session_id = require_str(&params, "sessionId")?;
            let prompt = require_str(&params, "prompt")?;
            let user_id = params.get("userId").and_then(Value::as_str);
            ctx.api.enqueue_run(session_id, prompt, user_id).await
        }
        "stopRun" => {
            let session_id = require_str(&params, "sessionId")?;
            ctx.api.stop_run(session_id).await
        }
        "decidePermission" => {
            let request_id = require_str(&params, "id")?;
            let decision = require_str(&params, "decision")?;
            ctx.api.decide_permission(request_id, decision).await
        }
        _ => Err(anyhow::anyhow!("METHOD_NOT_FOUND:{}", method)),
    }
}

fn require_str<'a>(params: &'a Value, field: &str) -> anyhow::Result<&'a str> {
    params
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing field: {field}"))
}

fn classify_error(e: &anyhow::Error) -> (i32, String) {
    let msg = e.to_string();

    if msg.starts_with("METHOD_NOT_FOUND:") {
        return (METHOD_NOT_FOUND, "Method not found".to_string());
    }
    if msg.starts_with("validation:") || msg.contains("missing field") {
        return (INVALID_PARAMS, msg);
    }
    if msg.starts_with("not found:") {
        return (SESSION_NOT_FOUND, msg);
    }
    if msg.starts_with("conflict:") || msg.contains("active session-runner job already exists") {
        return (CONFLICT, msg);
    }
    if msg.starts_with("unauthorized:") {
        return (UNAUTHORIZED, msg);
    }

    error!(err = %e, "internal error");
    (INTERNAL_ERROR, "Internal error".to_string())
}

/// Strip the user's home directory from error messages so RPC responses
/// never leak the full filesystem layout.
fn sanitize_path_in_message(msg: &str) -> String {
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return msg.replace(&home, "~");
        }
    }
    msg.to_string()
}

fn error_response(id: Value, code: i32, message: &str) -> String {
    let sanitized = sanitize_path_in_message(message);
    let resp = RpcResponse { jsonrpc: "2.0", id, result: None, error: Some(RpcError { code, message: sanitized }) };
    serde_json::to_string(&resp).unwrap_or_default()
}
