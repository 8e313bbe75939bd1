use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Default script root, relative to the working directory
pub const DEFAULT_SCRIPT_PATH: &str = "lua_scripts";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Root directory scanned for scripts (a leading `~` expands to $HOME on Unix)
    #[serde(default = "default_script_path")]
    pub script_path: String,

    /// Whether the host should watch the script tree and reload on changes
    #[serde(default)]
    pub hot_reload: bool,

    /// Hot reload scan interval in milliseconds (default: 1000ms)
    #[serde(default = "default_hot_reload_interval")]
    pub hot_reload_interval_ms: u64,

    /// Host tick interval in milliseconds, used to drive timed events (default: 50ms)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

fn default_script_path() -> String {
    DEFAULT_SCRIPT_PATH.to_string()
}

fn default_hot_reload_interval() -> u64 {
    1000
}

fn default_tick_interval() -> u64 {
    50
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            script_path: default_script_path(),
            hot_reload: false,
            hot_reload_interval_ms: default_hot_reload_interval(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(target: "scripting", "Loaded config from {}", path.display());
        Ok(config)
    }

    /// The script root with home-directory shorthand expanded
    pub fn script_root(&self) -> PathBuf {
        expand_home(&self.script_path)
    }

    pub fn hot_reload_interval(&self) -> Duration {
        Duration::from_millis(self.hot_reload_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Replace a leading `~` with the home directory.
///
/// Only applies on Unix-like platforms; elsewhere the path is taken as-is.
pub fn expand_home(path: &str) -> PathBuf {
    #[cfg(unix)]
    {
        if let Some(rest) = path.strip_prefix('~') {
            if let Some(home) = get_home_dir() {
                let mut expanded = home.into_os_string();
                expanded.push(rest);
                return PathBuf::from(expanded);
            }
        }
    }

    PathBuf::from(path)
}

/// Get the home directory, respecting HOME and USERPROFILE environment variables.
#[cfg(unix)]
fn get_home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("USERPROFILE").ok().map(PathBuf::from))
}
