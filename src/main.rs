use anyhow::{Context as _, Result};
use clap::Parser;
use memva::config::{db_path, Args, DaemonConfig};
use memva::ipc::event::EventBroadcaster;
use memva::maintenance::MaintenanceHandler;
use memva::session_runner::SessionRunnerHandler;
use memva::store::Store;
use memva::subprocess::resolve_executable;
use memva::worker::JobWorker;
use memva::{api::Api, auth, AppContext};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = DaemonConfig::new(&args).context("loading configuration")?;

    // Logging must be initialized before any tracing calls.
    let _log_guard = setup_logging(&config.log, Some(&config.data_dir));
    info!(data_dir = %config.data_dir.display(), port = config.port, "starting memvad");

    let store = Store::open(&db_path(&config.data_dir, args.production))
        .await
        .context("opening store")?;

    let permission_bridge_executable = current_exe_sibling("memva-permission-bridge")
        .context("locating memva-permission-bridge next to the running binary")?;

    // Fail fast if the configured CLI executable can't be found at all —
    // better to surface this at startup than on the first enqueued run.
    if let Err(e) = resolve_executable(&config.subprocess.executable_name, &config.data_dir) {
        tracing::warn!(err = %e, "configured subprocess executable not found on startup — runs will fail until resolved");
    }

    let mut worker = JobWorker::new(store.clone(), config.job_worker.clone());
    worker.register(
        "session-runner",
        Arc::new(SessionRunnerHandler::new(
            store.clone(),
            config.subprocess.clone(),
            config.default_settings.clone(),
            permission_bridge_executable,
        )),
    )?;
    worker.register("maintenance", Arc::new(MaintenanceHandler::new(store.clone())))?;
    let worker = Arc::new(worker);
    worker.clone().spawn();

    MaintenanceHandler::enqueue_startup_job(&store).await.context("enqueueing startup maintenance jobs")?;

    let api = Arc::new(Api::new(store.clone(), worker.clone()));
    let auth_token = auth::get_or_create_token(&config.data_dir).context("reading/creating auth token")?;

    let ctx = Arc::new(AppContext {
        config: Arc::new(config),
        store,
        broadcaster: Arc::new(EventBroadcaster::new()),
        worker,
        api,
        started_at: std::time::Instant::now(),
        auth_token,
    });

    memva::ipc::run(ctx).await
}

/// `memva-permission-bridge` is expected to live alongside `memvad` in the
/// same install directory (spec.md §4.8).
fn current_exe_sibling(name: &str) -> Result<std::path::PathBuf> {
    let exe = std::env::current_exe().context("resolving current executable path")?;
    let dir = exe.parent().context("executable has no parent directory")?;
    Ok(dir.join(name))
}

/// Logs to stdout, plus a daily-rolling file under `{data_dir}/logs` when a
/// data directory is known. Falls back to stdout-only if the log directory
/// can't be created — never panics on a bad path.
fn setup_logging(log_level: &str, data_dir: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let Some(data_dir) = data_dir else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        return None;
    };

    let log_dir = data_dir.join("logs");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("warn: could not create log directory '{}': {e} — falling back to stdout", log_dir.display());
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(&log_dir, "memvad.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .init();

    Some(guard)
}
