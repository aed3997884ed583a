//! Server configuration from environment variables.
//!
//! `main` loads `.env` through `dotenvy` first, then calls
//! `ServerConfig::from_env`. Parsing goes through `from_lookup` so it can be
//! exercised without touching the process environment.

use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::storage::StorageConfig;
use crate::sync::SessionConfig;

/// Signing secret used when `JWT_SECRET` is unset. Development only.
pub const DEV_JWT_SECRET: &str = "collab-session-dev-secret";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Everything the binary needs to start
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Sled database path
    pub storage_path: String,
    /// HS256 secret for handshake tokens
    pub jwt_secret: String,
    /// Base URL of the user service; selects the HTTP identity store
    pub identity_service_url: Option<String>,
    /// Users known to the in-memory identity store
    pub users: Vec<String>,
    /// Presence records idle longer than this are evicted
    pub presence_timeout: Duration,
    /// Interval of the presence sweep
    pub presence_sweep_interval: Duration,
    /// Quiet period before a document is written
    pub save_debounce: Duration,
    /// Write attempts before a save is reported failed
    pub save_max_attempts: u32,
    /// First retry delay for failed saves
    pub save_retry_initial: Duration,
    /// Cap on retry delays for failed saves
    pub save_retry_max: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            storage_path: "./data/collab.sled".to_string(),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            identity_service_url: None,
            users: Vec::new(),
            presence_timeout: Duration::from_secs(30),
            presence_sweep_interval: Duration::from_secs(5),
            save_debounce: Duration::from_millis(500),
            save_max_attempts: 5,
            save_retry_initial: Duration::from_millis(200),
            save_retry_max: Duration::from_millis(5000),
        }
    }
}

impl ServerConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup; unset or empty keys take their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let config = Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse(get("PORT"), "PORT", defaults.port)?,
            storage_path: get("STORAGE_PATH").unwrap_or(defaults.storage_path),
            jwt_secret: get("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            identity_service_url: get("IDENTITY_SERVICE_URL"),
            users: get("COLLAB_USERS")
                .map(|users| {
                    users
                        .split(',')
                        .map(str::trim)
                        .filter(|u| !u.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            presence_timeout: Duration::from_secs(parse(
                get("PRESENCE_TIMEOUT_SECS"),
                "PRESENCE_TIMEOUT_SECS",
                defaults.presence_timeout.as_secs(),
            )?),
            presence_sweep_interval: Duration::from_secs(parse(
                get("PRESENCE_SWEEP_SECS"),
                "PRESENCE_SWEEP_SECS",
                defaults.presence_sweep_interval.as_secs(),
            )?),
            save_debounce: Duration::from_millis(parse(
                get("SAVE_DEBOUNCE_MS"),
                "SAVE_DEBOUNCE_MS",
                defaults.save_debounce.as_millis() as u64,
            )?),
            save_max_attempts: parse(
                get("SAVE_MAX_ATTEMPTS"),
                "SAVE_MAX_ATTEMPTS",
                defaults.save_max_attempts,
            )?,
            save_retry_initial: Duration::from_millis(parse(
                get("SAVE_RETRY_INITIAL_MS"),
                "SAVE_RETRY_INITIAL_MS",
                defaults.save_retry_initial.as_millis() as u64,
            )?),
            save_retry_max: Duration::from_millis(parse(
                get("SAVE_RETRY_MAX_MS"),
                "SAVE_RETRY_MAX_MS",
                defaults.save_retry_max.as_millis() as u64,
            )?),
        };

        if config.save_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SAVE_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }
        if config.presence_sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "PRESENCE_SWEEP_SECS",
                value: "0".to_string(),
            });
        }

        Ok(config)
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether tokens are signed with the built-in development secret
    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<String>) -> Self {
        self.storage_path = path.into();
        self
    }

    pub fn with_jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.jwt_secret = secret.into();
        self
    }

    /// Backoff for failed saves
    pub fn save_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.save_retry_initial,
            self.save_retry_max,
            self.save_max_attempts.saturating_sub(1),
        )
        .with_jitter(true)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            presence_timeout: self.presence_timeout,
            presence_sweep_interval: self.presence_sweep_interval,
            save_debounce: self.save_debounce,
            save_retry: self.save_retry(),
            ..SessionConfig::default()
        }
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::new(&self.storage_path)
    }
}

fn parse<T: std::str::FromStr>(
    value: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}
