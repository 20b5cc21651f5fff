//! Process configuration.
//!
//! Values come from environment variables with defaults suited to a single
//! container deployment. `DATA_DIR` defaults to `/data` when that directory
//! exists (persistent volume), otherwise the current working directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

/// Where history records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStorage {
    Local,
    Supabase,
}

impl HistoryStorage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Supabase => "supabase",
        }
    }
}

/// Supabase credentials (service role key).
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub key: String,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Base directory for provider files (`image_providers.yaml`, `custom_providers.json`).
    pub data_dir: PathBuf,
    /// Root of per-task image directories and local history records.
    pub history_dir: PathBuf,
    pub cors_origins: Vec<String>,
    /// Idle time after which a finished task's in-memory state is evicted.
    pub task_ttl: Duration,
    /// How often the eviction sweep runs.
    pub task_sweep_interval: Duration,
    pub supabase: Option<SupabaseConfig>,
    pub history_storage: HistoryStorage,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = match std::env::var("PORT") {
            Ok(p) => p.parse::<u16>().context("PORT must be a valid port number")?,
            Err(_) => 7860,
        };

        let data_dir = match std::env::var("DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_data_dir(),
        };
        let history_dir = std::env::var("HISTORY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("history"));

        let cors_origins = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let task_ttl = Duration::from_secs(env_u64("TASK_TTL_SECS", 6 * 60 * 60)?);
        let task_sweep_interval = Duration::from_secs(env_u64("TASK_SWEEP_SECS", 600)?.max(1));

        let supabase = match (std::env::var("SUPABASE_URL"), std::env::var("SUPABASE_KEY")) {
            (Ok(url), Ok(key)) if !url.is_empty() && !key.is_empty() => {
                Some(SupabaseConfig { url, key })
            }
            _ => None,
        };

        let history_storage = match std::env::var("HISTORY_STORAGE").as_deref() {
            Ok("supabase") if supabase.is_some() => HistoryStorage::Supabase,
            Ok("supabase") => {
                tracing::warn!(
                    "HISTORY_STORAGE=supabase but SUPABASE_URL/SUPABASE_KEY are not set, using local storage"
                );
                HistoryStorage::Local
            }
            Ok("local") => HistoryStorage::Local,
            Ok(other) => anyhow::bail!("Unknown HISTORY_STORAGE value: {}", other),
            Err(_) if supabase.is_some() => HistoryStorage::Supabase,
            Err(_) => HistoryStorage::Local,
        };

        Ok(Self {
            host,
            port,
            data_dir,
            history_dir,
            cors_origins,
            task_ttl,
            task_sweep_interval,
            supabase,
            history_storage,
        })
    }

    /// Configuration rooted at `dir`, used by tests and local tooling.
    pub fn for_dir(dir: &Path) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            data_dir: dir.to_path_buf(),
            history_dir: dir.join("history"),
            cors_origins: vec!["*".to_string()],
            task_ttl: Duration::from_secs(6 * 60 * 60),
            task_sweep_interval: Duration::from_secs(600),
            supabase: None,
            history_storage: HistoryStorage::Local,
        }
    }

    pub fn image_providers_path(&self) -> PathBuf {
        self.data_dir.join("image_providers.yaml")
    }

    pub fn custom_providers_path(&self) -> PathBuf {
        self.data_dir.join("custom_providers.json")
    }
}

fn default_data_dir() -> PathBuf {
    let persistent = Path::new("/data");
    if persistent.is_dir() {
        persistent.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }
}

fn env_u64(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(v) => v
            .parse::<u64>()
            .with_context(|| format!("{} must be a non-negative integer", name)),
        Err(_) => Ok(default),
    }
}
