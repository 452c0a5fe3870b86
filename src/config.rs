//! Charm configuration
//!
//! Explicit configuration injected at startup. No address auto-detection.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Environment variables (`CHARM_STORAGE_ROOT`, `CHARM_PMAN_HOST`,
//!    `CHARM_PMAN_PORT`, `CHARM_MODE`)
//! 2. Config file (YAML)
//! 3. Defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::ExecutionMode;
use crate::error::{CharmError, Result};
use crate::remote::RetryConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharmConfig {
    /// Base directory for per-user feed trees
    pub storage_root: PathBuf,
    /// Mode used when a run does not name one
    pub default_mode: ExecutionMode,
    pub remote: RemoteConfig,
    pub local: LocalConfig,
}

impl Default for CharmConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./media"),
            default_mode: ExecutionMode::LocalSubprocess,
            remote: RemoteConfig::default(),
            local: LocalConfig::default(),
        }
    }
}

/// Remote job manager endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    /// Request path on the job manager
    pub path: String,
    /// Key the `{action, meta}` message is wrapped in; empty sends it bare
    pub json_wrapper: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub retry: RetrySettings,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5010,
            path: "/".to_string(),
            json_wrapper: "payload".to_string(),
            timeout_secs: 30,
            connect_timeout_secs: 10,
            retry: RetrySettings::default(),
        }
    }
}

impl RemoteConfig {
    pub fn endpoint(&self) -> Result<url::Url> {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        url::Url::parse(&format!("http://{}:{}{}", self.host, self.port, path))
            .map_err(|e| CharmError::config(format!("invalid remote endpoint: {}", e)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        RetryConfig::default()
            .with_max_retries(s.max_retries)
            .with_initial_delay(Duration::from_millis(s.initial_delay_ms))
            .with_max_delay(Duration::from_millis(s.max_delay_ms))
            .with_backoff_multiplier(s.backoff_multiplier)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Upper bound on a local subprocess run
    pub timeout_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self { timeout_secs: 3600 }
    }
}

impl LocalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl CharmConfig {
    /// Load configuration from a YAML file
    ///
    /// Returns default config if the file doesn't exist.
    /// Returns error if the file exists but is malformed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            CharmError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            CharmError::config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Environment variables take precedence over file values
    pub fn with_env(self) -> Result<Self> {
        self.with_vars(|key| std::env::var(key).ok())
    }

    fn with_vars(mut self, get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(root) = get("CHARM_STORAGE_ROOT") {
            self.storage_root = PathBuf::from(root);
        }
        if let Some(host) = get("CHARM_PMAN_HOST") {
            self.remote.host = host;
        }
        if let Some(port) = get("CHARM_PMAN_PORT") {
            self.remote.port = port
                .parse()
                .map_err(|_| CharmError::config(format!("CHARM_PMAN_PORT '{}' is not a port", port)))?;
        }
        if let Some(mode) = get("CHARM_MODE") {
            self.default_mode = mode.parse()?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(CharmError::config("storage_root is empty"));
        }
        if self.remote.host.trim().is_empty() {
            return Err(CharmError::config("remote.host is empty"));
        }
        if self.remote.port == 0 {
            return Err(CharmError::config("remote.port must be non-zero"));
        }
        if self.remote.retry.backoff_multiplier < 1.0 {
            return Err(CharmError::config("remote.retry.backoff_multiplier must be >= 1.0"));
        }
        self.remote.endpoint().map(|_| ())
    }
}
