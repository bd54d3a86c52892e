pub mod events;
pub mod jobs;
pub mod permissions;
pub mod sessions;
pub mod settings;

use anyhow::Result;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

/// Default timeout for individual queries. Prevents a hung query (e.g. a
/// contended writer lock) from blocking a worker indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub(crate) async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "store query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// Embedded transactional store. Exposes typed repositories for sessions,
/// events, jobs, permission requests, and settings over a single SQLite
/// pool opened in WAL mode. The same on-disk file is opened independently
/// by PermissionBridge subprocesses (spec.md §4.1) — WAL mode is what
/// makes that safe without a shared in-process lock.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(10))
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Clone of the underlying pool, for repositories constructed separately
    /// (e.g. in tests that want to open their own `Store` facade per table).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    pub fn sessions(&self) -> sessions::SessionRepo {
        sessions::SessionRepo::new(self.pool.clone())
    }

    pub fn events(&self) -> events::EventRepo {
        events::EventRepo::new(self.pool.clone())
    }

    pub fn jobs(&self) -> jobs::JobRepo {
        jobs::JobRepo::new(self.pool.clone())
    }

    pub fn permissions(&self) -> permissions::PermissionRepo {
        permissions::PermissionRepo::new(self.pool.clone())
    }

    pub fn settings(&self) -> settings::SettingsRepo {
        settings::SettingsRepo::new(self.pool.clone())
    }
}
