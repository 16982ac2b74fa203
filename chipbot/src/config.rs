//! Configuration for the chipbot process.
//!
//! Paths follow this precedence:
//! 1. An explicit CLI flag
//! 2. A dedicated environment variable (`CHIPBOT_DATA_DIR`, `CHIPBOT_DB_PATH`)
//! 3. `~/.config/chipbot/data` (production default)
//! 4. `./data` (fallback for development)
//!
//! Process settings live in `bot_config.json` inside the data directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_DIR: &str = ".config/chipbot/data";
const DEV_DATA_DIR: &str = "./data";
const DATABASE_FILE: &str = "db.sqlite3";
const CONFIG_FILE: &str = "bot_config.json";
pub const LOG_FILE: &str = "chipbot.log";

/// Get the data directory.
///
/// Priority:
/// 1. CHIPBOT_DATA_DIR env variable if set
/// 2. $HOME/.config/chipbot/data if HOME is set
/// 3. ./data as fallback
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CHIPBOT_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(DEFAULT_CONFIG_DIR);
    }

    PathBuf::from(DEV_DATA_DIR)
}

/// Get the database path: CHIPBOT_DB_PATH if set, else `<data_dir>/db.sqlite3`.
pub fn get_database_path(data_dir: &Path) -> PathBuf {
    if let Ok(path) = std::env::var("CHIPBOT_DB_PATH") {
        return PathBuf::from(path);
    }

    data_dir.join(DATABASE_FILE)
}

pub fn get_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file {0} did not exist, wrote the default config into it")]
    WroteDefault(PathBuf),
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize the default config for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Settings read from `bot_config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Log to stderr instead of `<data_dir>/chipbot.log`.
    pub log_to_console: bool,
    /// Default tracing filter, e.g. `debug` or `info,chipbot_storage=debug`.
    pub logging_level: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            log_to_console: false,
            logging_level: "debug".to_string(),
        }
    }
}

impl BotConfig {
    /// Load the config at `path`.
    ///
    /// A missing file is replaced by the defaults and reported as
    /// [`ConfigError::WroteDefault`], so the operator reviews it before the
    /// next start.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
            let json = serde_json::to_string_pretty(&Self::default()).map_err(|source| {
                ConfigError::Serialize {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            std::fs::write(path, json).map_err(io_err)?;
            return Err(ConfigError::WroteDefault(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path).map_err(io_err)?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
