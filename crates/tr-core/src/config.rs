use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding `dispatcher.host`.
pub const ENV_HOST: &str = "HASHEOUS_HOST";
/// Environment variable carrying the dispatcher API key.
pub const ENV_API_KEY: &str = "HASHEOUS_API_KEY";
/// Environment variable overriding `updates.enabled`.
pub const ENV_UPDATES_ENABLED: &str = "HASHEOUS_UPDATES_ENABLED";

/// Top-level configuration loaded from `~/.hasheous-taskrunner/config.toml`.
///
/// The dispatcher API key is never read from or written to the file; it is
/// only taken from the `HASHEOUS_API_KEY` environment variable.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub updates: UpdatesConfig,
}

impl Config {
    /// Load config from the default path, falling back to defaults when the
    /// file does not exist. Environment overrides are applied afterwards.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            Self::read_file(&path)?
        } else {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            Config::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific path without consulting the environment.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let cfg = Self::read_file(&path.into())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `HASHEOUS_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides using `lookup` to resolve variable names.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST).filter(|v| !v.trim().is_empty()) {
            self.dispatcher.host = host.trim().to_string();
        }
        if let Some(key) = lookup(ENV_API_KEY).filter(|v| !v.trim().is_empty()) {
            self.dispatcher.api_key = Some(key.trim().to_string());
        }
        if let Some(raw) = lookup(ENV_UPDATES_ENABLED) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.updates.enabled = true,
                "0" | "false" | "no" | "off" => self.updates.enabled = false,
                other => {
                    tracing::warn!(value = other, "ignoring unrecognised {ENV_UPDATES_ENABLED}")
                }
            }
        }
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "dispatcher.host must not be empty".to_string(),
            ));
        }
        self.intervals.validate()?;
        if self.updates.feed_url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "updates.feed_url must not be empty".to_string(),
            ));
        }
        if self.updates.user_agent.trim().is_empty() {
            return Err(ConfigError::Validation(
                "updates.user_agent must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn read_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hasheous-taskrunner")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_dispatcher_timeout")]
    pub request_timeout_secs: u64,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl std::fmt::Debug for DispatcherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherConfig")
            .field("host", &self.host)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            request_timeout_secs: default_dispatcher_timeout(),
            api_key: None,
        }
    }
}

impl DispatcherConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_host() -> String {
    "https://hasheous.org".into()
}
fn default_dispatcher_timeout() -> u64 {
    30
}

/// Cadences of the agent loop and its periodic actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalsConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_registration_secs")]
    pub registration_secs: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            registration_secs: default_registration_secs(),
        }
    }
}

impl IntervalsConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn registration(&self) -> Duration {
        Duration::from_secs(self.registration_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_secs == 0 {
            return Err(ConfigError::Validation(
                "intervals.tick_secs must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_secs == 0 || self.registration_secs == 0 {
            return Err(ConfigError::Validation(
                "intervals.heartbeat_secs and intervals.registration_secs must be greater than zero"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn default_tick_secs() -> u64 {
    10
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_registration_secs() -> u64 {
    3600
}

/// Self-update settings. The check interval itself is fixed at 24 hours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_feed_url")]
    pub feed_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_update_timeout")]
    pub request_timeout_secs: u64,
    /// Set to any value to mark the process as running in a development checkout.
    #[serde(default = "default_dev_marker_var")]
    pub dev_marker_var: String,
    /// Set to any value to mark the process as running inside a container.
    #[serde(default = "default_container_marker_var")]
    pub container_marker_var: String,
    #[serde(default = "default_container_marker_file")]
    pub container_marker_file: String,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            feed_url: default_feed_url(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_update_timeout(),
            dev_marker_var: default_dev_marker_var(),
            container_marker_var: default_container_marker_var(),
            container_marker_file: default_container_marker_file(),
        }
    }
}

impl UpdatesConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_true() -> bool {
    true
}
fn default_feed_url() -> String {
    "https://api.github.com/repos/gaseous-project/hasheous-taskrunner/releases".into()
}
fn default_user_agent() -> String {
    "hasheous-taskrunner".into()
}
fn default_update_timeout() -> u64 {
    120
}
fn default_dev_marker_var() -> String {
    "HASHEOUS_TASKRUNNER_DEV".into()
}
fn default_container_marker_var() -> String {
    "HASHEOUS_TASKRUNNER_CONTAINER".into()
}
fn default_container_marker_file() -> String {
    "/.dockerenv".into()
}
