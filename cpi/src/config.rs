use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub director: DirectorConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

/// Connection and credentials for the control plane.
#[derive(Clone, Deserialize)]
pub struct DirectorConfig {
    pub url: String,
    pub user: String,
    pub organization: String,
    pub password: String,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    pub virtual_datacenter: Option<String>,
}

impl std::fmt::Debug for DirectorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("organization", &self.organization)
            .field("password", &"<redacted>")
            .field("verify_ssl", &self.verify_ssl)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("virtual_datacenter", &self.virtual_datacenter)
            .finish()
    }
}

/// Polling, retry and session parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_wait_max")]
    pub wait_max_secs: u64,
    #[serde(default = "default_wait_delay")]
    pub wait_delay_secs: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_cookie_timeout")]
    pub cookie_timeout_secs: u64,
    #[serde(default = "default_old_task_threshold")]
    pub old_task_threshold_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            wait_max_secs: default_wait_max(),
            wait_delay_secs: default_wait_delay(),
            retry_max: default_retry_max(),
            retry_delay_ms: default_retry_delay(),
            cookie_timeout_secs: default_cookie_timeout(),
            old_task_threshold_secs: default_old_task_threshold(),
        }
    }
}

impl ControlConfig {
    pub fn wait_max(&self) -> Duration {
        Duration::from_secs(self.wait_max_secs)
    }

    pub fn wait_delay(&self) -> Duration {
        Duration::from_secs(self.wait_delay_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn cookie_timeout(&self) -> Duration {
        Duration::from_secs(self.cookie_timeout_secs)
    }

    pub fn old_task_threshold(&self) -> Duration {
        Duration::from_secs(self.old_task_threshold_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

// Default functions
fn default_verify_ssl() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    30
}

fn default_wait_max() -> u64 {
    300
}

fn default_wait_delay() -> u64 {
    5
}

fn default_retry_max() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    500
}

fn default_cookie_timeout() -> u64 {
    1500
}

fn default_old_task_threshold() -> u64 {
    600
}
