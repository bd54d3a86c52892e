use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Configuration file layered under CLI flags and environment variables.
/// Matches the on-disk layout described in spec.md §6: a single data
/// directory under the user home.
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    data_dir: Option<String>,
    port: Option<u16>,
    log: Option<String>,
    log_file: Option<String>,
    job_worker: Option<TomlJobWorkerConfig>,
    subprocess: Option<TomlSubprocessConfig>,
    settings: Option<TomlSettingsConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlJobWorkerConfig {
    concurrent: Option<usize>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlSubprocessConfig {
    executable_name: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlSettingsConfig {
    max_turns: Option<u32>,
    permission_mode: Option<String>,
}

#[derive(Parser, Debug)]
#[command(name = "memvad", about = "Memva session manager daemon")]
pub struct Args {
    /// Directory holding the embedded store, logs, and temp uploads.
    #[arg(long, env = "MEMVA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Port for the thin WebSocket JSON-RPC surface.
    #[arg(long, env = "MEMVA_PORT")]
    pub port: Option<u16>,

    /// Path to a TOML config file. Defaults to `{data_dir}/config.toml` if present.
    #[arg(long, env = "MEMVA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level filter (passed to `tracing_subscriber::EnvFilter`). Left
    /// unset (rather than defaulted) so the TOML file can be told apart
    /// from an explicit CLI/env override when layering config sources.
    #[arg(long, env = "MEMVA_LOG")]
    pub log: Option<String>,

    /// Number of concurrent job workers.
    #[arg(long, env = "MEMVA_JOB_CONCURRENCY")]
    pub job_concurrency: Option<usize>,

    /// Use `memva-prod.db` instead of `memva.db` (spec.md §6).
    #[arg(long, env = "MEMVA_PRODUCTION", default_value_t = false)]
    pub production: bool,
}

/// Job worker pool sizing and retry policy (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    pub concurrent: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            concurrent: 20,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

/// Subprocess launch policy (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    pub executable_name: String,
    pub timeout_secs: u64,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            executable_name: "claude".to_string(),
            timeout_secs: 24 * 60 * 60,
        }
    }
}

/// Process-wide settings defaults (spec.md §3 Settings singleton).
#[derive(Debug, Clone)]
pub struct DefaultSettings {
    pub max_turns: u32,
    pub permission_mode: String,
}

impl Default for DefaultSettings {
    fn default() -> Self {
        Self {
            max_turns: 200,
            permission_mode: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub port: u16,
    pub log: String,
    pub job_worker: JobWorkerConfig,
    pub subprocess: SubprocessConfig,
    pub default_settings: DefaultSettings,
}

impl DaemonConfig {
    /// Build the effective configuration: CLI args override the TOML file,
    /// which overrides built-in defaults. Mirrors the teacher's own
    /// CLI-over-file-over-default layering.
    pub fn new(args: &Args) -> Result<Self> {
        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(default_data_dir);

        let config_path = args
            .config
            .clone()
            .unwrap_or_else(|| data_dir.join("config.toml"));
        let toml_cfg = load_toml(&config_path)?;

        let job_worker = {
            let mut cfg = JobWorkerConfig::default();
            if let Some(tj) = &toml_cfg.job_worker {
                if let Some(c) = tj.concurrent {
                    cfg.concurrent = c;
                }
                if let Some(m) = tj.max_retries {
                    cfg.max_retries = m;
                }
                if let Some(r) = tj.retry_delay_ms {
                    cfg.retry_delay_ms = r;
                }
            }
            if let Some(c) = args.job_concurrency {
                cfg.concurrent = c;
            }
            cfg
        };

        let subprocess = {
            let mut cfg = SubprocessConfig::default();
            if let Some(ts) = &toml_cfg.subprocess {
                if let Some(name) = &ts.executable_name {
                    cfg.executable_name = name.clone();
                }
                if let Some(t) = ts.timeout_secs {
                    cfg.timeout_secs = t;
                }
            }
            cfg
        };

        let default_settings = {
            let mut cfg = DefaultSettings::default();
            if let Some(ts) = &toml_cfg.settings {
                if let Some(mt) = ts.max_turns {
                    cfg.max_turns = mt;
                }
                if let Some(pm) = &ts.permission_mode {
                    cfg.permission_mode = pm.clone();
                }
            }
            cfg
        };

        Ok(Self {
            data_dir,
            port: args.port.or(toml_cfg.port).unwrap_or(4300),
            log: args.log.clone().or(toml_cfg.log).unwrap_or_else(|| "info".to_string()),
            job_worker,
            subprocess,
            default_settings,
        })
    }
}

fn default_data_dir() -> PathBuf {
    dirs_home().join(".memva")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Production database path per spec.md §6 (`~/.memva/memva-prod.db`).
pub fn db_path(data_dir: &Path, production: bool) -> PathBuf {
    let name = if production { "memva-prod.db" } else { "memva.db" };
    data_dir.join(name)
}

fn load_toml(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        return Ok(TomlConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}
