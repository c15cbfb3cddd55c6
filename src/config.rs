//! Process configuration read from the environment (after `.env` is loaded)

use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:3000/api";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;
const DB_FILE_NAME: &str = "checkup-sync.db";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a positive number of seconds, got {value:?}")]
    InvalidDuration { key: &'static str, value: String },

    #[error("Could not determine a data directory; set CHECKUP_DB_PATH or HOME")]
    NoDataDir,

    #[error("Failed to create data directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_url: String,
    pub db_path: PathBuf,
    pub http_timeout: Duration,
    pub probe_timeout: Duration,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or blank keys take defaults
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_url = get("CHECKUP_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let db_path = match get("CHECKUP_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_db_path()?,
        };

        let http_timeout = seconds("CHECKUP_HTTP_TIMEOUT_SECS", get("CHECKUP_HTTP_TIMEOUT_SECS"), DEFAULT_HTTP_TIMEOUT_SECS)?;
        let probe_timeout = seconds("CHECKUP_PROBE_TIMEOUT_SECS", get("CHECKUP_PROBE_TIMEOUT_SECS"), DEFAULT_PROBE_TIMEOUT_SECS)?;

        Ok(Self {
            api_url,
            db_path,
            http_timeout,
            probe_timeout,
        })
    }

    /// Make sure the database's parent directory exists
    pub fn ensure_data_dir(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}

fn default_db_path() -> Result<PathBuf, ConfigError> {
    let dirs = ProjectDirs::from("com", "checkup", "checkup-sync").ok_or(ConfigError::NoDataDir)?;
    Ok(dirs.data_dir().join(DB_FILE_NAME))
}

fn seconds(key: &'static str, value: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => match raw.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ConfigError::InvalidDuration { key, value: raw }),
        },
    }
}
