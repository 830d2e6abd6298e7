//! Runtime configuration for companion-daemon.
//!
//! Loaded from `~/.companion/config.toml` (or an explicit path). Every section
//! is optional; a missing file yields the defaults below.

use chrono::Duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{CompanionError, Result};
use crate::privacy::PrivacyPolicy;

pub const DATA_DIR_NAME: &str = ".companion";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CompanionConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub privacy: PrivacyPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 43917,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub roots: Vec<PathBuf>,
    pub ignore_patterns: Vec<String>,
    pub settle_delay_ms: u64,
    pub max_file_bytes: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            ignore_patterns: [
                "node_modules",
                ".git",
                "target",
                "dist",
                "build",
                "__pycache__",
                ".venv",
                ".next",
                ".DS_Store",
                "*.log",
                "*.lock",
                "*.swp",
                "*.tmp",
                "*~",
            ]
            .iter()
            .map(|pattern| pattern.to_string())
            .collect(),
            settle_delay_ms: 500,
            max_file_bytes: crate::change_detector::MAX_FILE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub significance_threshold: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            significance_threshold: 12,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub inactivity_timeout_secs: i64,
    pub check_interval_secs: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 30 * 60,
            check_interval_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub link_window_secs: i64,
    pub prompt_max_age_secs: i64,
    pub eviction_interval_secs: i64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            link_window_secs: 5 * 60,
            prompt_max_age_secs: 10 * 60,
            eviction_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub grace_window_secs: i64,
    pub retention_interval_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            grace_window_secs: 60 * 60,
            retention_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub enabled: bool,
    /// Editor `workspaceStorage` directory; platform default when unset.
    pub storage_dir: Option<PathBuf>,
    pub sync_interval_secs: i64,
    pub resource_sample_interval_secs: i64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage_dir: None,
            sync_interval_secs: 10,
            resource_sample_interval_secs: 30,
        }
    }
}

pub fn seconds(value: i64) -> Duration {
    Duration::seconds(value.max(1))
}

pub fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(CompanionError::HomeDirNotFound)?;
    Ok(home.join(DATA_DIR_NAME))
}

pub fn default_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

pub fn load_config(path: &Path) -> Result<CompanionConfig> {
    if !path.exists() {
        return Ok(CompanionConfig::default());
    }

    let content = fs_err::read_to_string(path)
        .map_err(|err| CompanionError::io(format!("read config {}", path.display()), err))?;
    toml::from_str::<CompanionConfig>(&content).map_err(|err| CompanionError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}
