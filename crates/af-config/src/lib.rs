//! apiflow client configuration
//!
//! Loads client-level defaults from a TOML file, then layers `APIFLOW_*`
//! environment variables on top. Every field has a default so an empty
//! file (or no file at all) yields a usable configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Prefix joined onto relative request URLs
    pub base_url: Option<String>,
    /// Total budget per request, covering every retry attempt
    pub timeout_ms: u64,
    /// Headers applied beneath caller-supplied headers
    pub headers: HashMap<String, String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 30_000,
            headers: HashMap::new(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub respect_retry_after: bool,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            respect_retry_after: true,
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Limit applied to any group without an explicit entry
    pub limit: usize,
    /// Per-group limits keyed by concurrency group name
    pub groups: HashMap<String, usize>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            limit: 6,
            groups: HashMap::new(),
        }
    }
}

impl ConcurrencyConfig {
    pub fn limit_for(&self, group: &str) -> usize {
        self.groups.get(group).copied().unwrap_or(self.limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Key the token is persisted under
    pub storage_key: String,
    /// Endpoint called to obtain a fresh token
    pub refresh_path: String,
    /// Where the UI can send the user after the session expires.
    /// `None` means no login route is reachable.
    pub login_route: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            storage_key: "auth_token".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            login_route: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadingConfig {
    pub default_timeout_ms: Option<u64>,
    /// How long an error visual stays before clearing itself
    pub error_grace_ms: u64,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            error_grace_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Maximum simultaneous notifications before the oldest is evicted
    pub capacity: usize,
    pub default_duration_ms: u64,
    pub error_duration_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            default_duration_ms: 5000,
            error_duration_ms: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

// ============================================================================
// Root
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub http: HttpConfig,
    pub retry: RetryConfig,
    pub concurrency: ConcurrencyConfig,
    pub auth: AuthConfig,
    pub loading: LoadingConfig,
    pub notifications: NotificationConfig,
    pub events: EventConfig,
}

impl ClientConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&raw)?;
        info!(path = %path.display(), "Loaded client configuration");
        Ok(config)
    }

    /// File (when given) plus environment overrides, validated
    pub fn load_with_env(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p).with_context(|| format!("loading {}", p.display()))?,
            None => Self::default(),
        };
        config.apply_env_overrides().context("applying APIFLOW_* overrides")?;
        config.validate().context("validating configuration")?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup; `apply_env_overrides` uses the process env
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("APIFLOW_BASE_URL") {
            self.http.base_url = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "APIFLOW_TIMEOUT_MS")? {
            self.http.timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "APIFLOW_RETRY_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "APIFLOW_RETRY_BASE_DELAY_MS")? {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "APIFLOW_RETRY_MAX_DELAY_MS")? {
            self.retry.max_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "APIFLOW_CONCURRENCY_LIMIT")? {
            self.concurrency.limit = v;
        }
        if let Some(v) = lookup("APIFLOW_AUTH_STORAGE_KEY") {
            self.auth.storage_key = v;
        }
        if let Some(v) = lookup("APIFLOW_AUTH_REFRESH_PATH") {
            self.auth.refresh_path = v;
        }
        if let Some(v) = lookup("APIFLOW_LOGIN_ROUTE") {
            self.auth.login_route = if v.is_empty() { None } else { Some(v) };
        }
        debug!(config = ?self, "Applied environment overrides");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.backoff_multiplier must be >= 1.0".into()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }
        if self.concurrency.limit == 0 {
            return Err(ConfigError::Invalid("concurrency.limit must be at least 1".into()));
        }
        if let Some((group, _)) = self.concurrency.groups.iter().find(|(_, l)| **l == 0) {
            return Err(ConfigError::Invalid(format!(
                "concurrency.groups.{} must be at least 1",
                group
            )));
        }
        if self.http.timeout_ms == 0 {
            return Err(ConfigError::Invalid("http.timeout_ms must be positive".into()));
        }
        if self.notifications.capacity == 0 {
            return Err(ConfigError::Invalid("notifications.capacity must be at least 1".into()));
        }
        if self.auth.storage_key.is_empty() {
            return Err(ConfigError::Invalid("auth.storage_key must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
    }
}
