// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates account settings and provides defaults for sync, retry and wait tuning
use crate::backoff::BackoffConfig;
use crate::session::Credentials;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub matrix: MatrixConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub retry: BackoffConfig,
    #[serde(default)]
    pub wait: WaitConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    #[serde(default = "default_homeserver")]
    pub homeserver: String,
    /// Full user id (`@bot:example.org`) or bare localpart
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Room used when a caller names none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_room: Option<String>,
}

// Custom Debug impl to redact the password
impl std::fmt::Debug for MatrixConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixConfig")
            .field("homeserver", &self.homeserver)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("device_name", &self.device_name)
            .field("default_room", &self.default_room)
            .finish()
    }
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            homeserver: default_homeserver(),
            username: String::new(),
            password: String::new(),
            device_name: default_device_name(),
            default_room: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Server-side long-poll timeout
    #[serde(default = "default_sync_timeout_ms")]
    pub timeout_ms: u64,
    /// Batches arriving this soon after start are treated as backlog
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_initial_timeline_limit")]
    pub initial_timeline_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_sync_timeout_ms(),
            grace_ms: default_grace_ms(),
            initial_timeline_limit: default_initial_timeline_limit(),
        }
    }
}

impl SyncConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitConfig {
    #[serde(default = "default_wait_timeout_secs")]
    pub default_timeout_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

impl WaitConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

fn default_homeserver() -> String {
    "https://matrix.org".to_string()
}

fn default_device_name() -> String {
    "mcp-server".to_string()
}

fn default_sync_timeout_ms() -> u64 {
    30_000
}

fn default_grace_ms() -> u64 {
    2_000
}

fn default_initial_timeline_limit() -> u32 {
    20
}

fn default_wait_timeout_secs() -> u64 {
    300 // 5 minutes
}

impl Config {
    /// Find the config file:
    /// 1. TETHER_CONFIG_PATH env var (if set)
    /// 2. ./config.toml (current directory)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("TETHER_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!(path = %env_path, "TETHER_CONFIG_PATH does not exist, ignoring");
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        None
    }

    /// Load configuration from config.toml with environment variable overrides
    pub fn load() -> Result<Self> {
        let mut config = if let Some(config_path) = Self::find_config_file() {
            tracing::info!(
                path = %config_path.display(),
                "Loading configuration from file"
            );
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            tracing::info!("No config file found, using environment variables and defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        let matrix = &mut self.matrix;
        if let Ok(val) = std::env::var("MATRIX_HOMESERVER") {
            matrix.homeserver = val;
        }
        if let Ok(val) = std::env::var("MATRIX_USERNAME") {
            matrix.username = val;
        }
        if let Ok(val) = std::env::var("MATRIX_PASSWORD") {
            matrix.password = val;
        }
        if let Ok(val) = std::env::var("MATRIX_DEVICE_NAME") {
            matrix.device_name = val;
        }
        if let Ok(val) = std::env::var("MATRIX_ROOMID") {
            matrix.default_room = Some(val).filter(|v| !v.trim().is_empty());
        }
    }

    /// Check required fields and value ranges
    pub fn validate(&self) -> Result<()> {
        let matrix = &self.matrix;
        if !(matrix.homeserver.starts_with("https://") || matrix.homeserver.starts_with("http://"))
        {
            anyhow::bail!(
                "matrix.homeserver must be an http(s) URL, got: {}",
                matrix.homeserver
            );
        }
        if matrix.username.trim().is_empty() {
            anyhow::bail!(
                "matrix.username is required (set in config.toml or MATRIX_USERNAME env var)"
            );
        }
        if matrix.username.starts_with('@') && !matrix.username.contains(':') {
            anyhow::bail!("Invalid Matrix user ID: {}", matrix.username);
        }
        if matrix.password.is_empty() {
            anyhow::bail!(
                "matrix.password is required (set in config.toml or MATRIX_PASSWORD env var)"
            );
        }
        if let Some(room) = &matrix.default_room {
            if !(room.starts_with('!') || room.starts_with('#')) {
                anyhow::bail!(
                    "matrix.default_room must be a room id (!...) or alias (#...), got: {}",
                    room
                );
            }
        }
        if self.retry.max_retries < 1 {
            anyhow::bail!("retry.max_retries must be at least 1");
        }
        if self.retry.multiplier < 1 {
            anyhow::bail!("retry.multiplier must be at least 1");
        }
        if self.wait.default_timeout_secs == 0 {
            anyhow::bail!("wait.default_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.matrix.username.clone(),
            password: self.matrix.password.clone(),
            device_name: self.matrix.device_name.clone(),
        }
    }
}
