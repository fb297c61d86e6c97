//! Proxy process settings.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings of the proxy process itself (`shroud.yaml`).
///
/// Tenant configuration lives in [`config_dir`](Self::config_dir) and is
/// hot-reloaded; these settings are read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address every namespace listener binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Tenant configuration directory.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Idle session timeout in seconds. 0 disables the timer.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Bounded wait for a backend connection, in milliseconds.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// Poll interval of the configuration watcher, in milliseconds.
    #[serde(default = "default_reload_interval")]
    pub reload_interval_ms: u64,

    /// How long a retired namespace waits for its sessions before its pools
    /// are closed, in seconds.
    #[serde(default = "default_close_grace")]
    pub close_grace_secs: u64,

    /// Default tracing filter.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            config_dir: default_config_dir(),
            session_timeout_secs: default_session_timeout(),
            acquire_timeout_ms: default_acquire_timeout(),
            reload_interval_ms: default_reload_interval(),
            close_grace_secs: default_close_grace(),
            log_filter: default_log_filter(),
        }
    }
}

impl ProxyConfig {
    /// Load settings from a YAML file. Relative `config_dir` values are
    /// resolved against the file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content)?;
        if config.config_dir.is_relative() {
            if let Some(base) = path.parent() {
                config.config_dir = base.join(&config.config_dir);
            }
        }
        Ok(config)
    }

    /// Parse settings from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_secs > 0).then(|| Duration::from_secs(self.session_timeout_secs))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.reload_interval_ms.max(100))
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("conf")
}

fn default_session_timeout() -> u64 {
    3600
}

fn default_acquire_timeout() -> u64 {
    3000
}

fn default_reload_interval() -> u64 {
    2000
}

fn default_close_grace() -> u64 {
    30
}

fn default_log_filter() -> String {
    "info".to_string()
}
