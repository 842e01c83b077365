// src/config.rs
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {name} has an invalid value '{value}'")]
    InvalidVar { name: String, value: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is not valid: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no rabbit-courier.json found in the current directory, ./config or the home directory")]
    NotFound,

    #[error("configuration error: {0}")]
    Invalid(String),
}

/// Which client implementation talks to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// AMQP 0-9-1 over the network through lapin.
    #[default]
    Lapin,
    /// The in-process broker.
    Memory,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lapin" | "amqp" => Ok(BackendKind::Lapin),
            "memory" | "in-memory" => Ok(BackendKind::Memory),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Broker connection settings. Immutable once handed to a `ConnectionManager`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
    #[serde(default)]
    pub backend: BackendKind,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 5672 }
fn default_vhost() -> String { "/".to_string() }
fn default_username() -> String { "guest".to_string() }
fn default_password() -> String { "guest".to_string() }
fn default_prefetch_count() -> u16 { 10 }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_confirm_timeout_ms() -> u64 { 5_000 }
fn default_heartbeat() -> u16 { 30 }

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: default_host(),
            port: default_port(),
            vhost: default_vhost(),
            username: default_username(),
            password: default_password(),
            prefetch_count: default_prefetch_count(),
            connect_timeout_ms: default_connect_timeout_ms(),
            confirm_timeout_ms: default_confirm_timeout_ms(),
            heartbeat_seconds: default_heartbeat(),
            backend: BackendKind::default(),
        }
    }
}

impl BrokerConfig {
    /// Config for the in-process broker, otherwise default.
    pub fn in_memory() -> Self {
        BrokerConfig {
            backend: BackendKind::Memory,
            ..Default::default()
        }
    }

    /// Reads `RABBITMQ_*` variables, after loading a `.env` file if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let defaults = BrokerConfig::default();
        let config = BrokerConfig {
            host: env::var("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: parse_var("RABBITMQ_PORT", defaults.port)?,
            vhost: env::var("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
            username: env::var("RABBITMQ_USERNAME").unwrap_or(defaults.username),
            password: env::var("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            prefetch_count: parse_var("RABBITMQ_PREFETCH_COUNT", defaults.prefetch_count)?,
            connect_timeout_ms: parse_var("RABBITMQ_CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms)?,
            confirm_timeout_ms: parse_var("RABBITMQ_CONFIRM_TIMEOUT_MS", defaults.confirm_timeout_ms)?,
            heartbeat_seconds: parse_var("RABBITMQ_HEARTBEAT_SECONDS", defaults.heartbeat_seconds)?,
            backend: parse_var("RABBITMQ_BACKEND", defaults.backend)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: BrokerConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host cannot be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port cannot be 0".into()));
        }
        if self.username.is_empty() {
            return Err(ConfigError::Invalid("username cannot be empty".into()));
        }
        if self.connect_timeout_ms == 0 || self.confirm_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connection URI with the password masked, for logs.
    pub fn redacted_uri(&self) -> String {
        format!(
            "amqp://{}:***@{}:{}/{}",
            self.username,
            self.host,
            self.port,
            self.vhost.replace('/', "%2f")
        )
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidVar {
            name: name.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

/// Looks for `rabbit-courier.json` in `.`, `./config`, then `~/.rabbit-courier.json`.
pub fn find_config_file() -> Result<PathBuf, ConfigError> {
    let locations = [
        ("Current directory", Path::new("rabbit-courier.json")),
        ("Config directory", Path::new("config/rabbit-courier.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".rabbit-courier.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(ConfigError::NotFound)
}
