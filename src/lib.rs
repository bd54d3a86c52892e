pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod ipc;
pub mod maintenance;
pub mod session_runner;
pub mod store;
pub mod subprocess;
pub mod worker;

pub use ipc::auth;

use api::Api;
use config::DaemonConfig;
use ipc::event::EventBroadcaster;
use std::sync::Arc;
use store::Store;
use worker::JobWorker;

/// Shared application state passed to the IPC server and every RPC handler.
/// Kept thin: the daemon's actual behavior lives in `Store`, `JobWorker`,
/// and the handlers registered on it, not here.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub store: Store,
    pub broadcaster: Arc<EventBroadcaster>,
    pub worker: Arc<JobWorker>,
    pub api: Arc<Api>,
    pub started_at: std::time::Instant,
    /// Local WebSocket auth token. Every new connection must send a
    /// `daemon.auth` RPC with this token before any other method call.
    /// Empty string disables the handshake (not recommended).
    pub auth_token: String,
}
