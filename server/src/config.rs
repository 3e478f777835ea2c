//! Server configuration
//!
//! Loaded from TOML: the file named by `AIRSENSE_CONFIG`, else
//! `config/server.toml`, else built-in defaults. `DATABASE_URL` and
//! `AIRSENSE_BIND` override whatever the file says.
//!
//! ```toml
//! [listener]
//! bind = "0.0.0.0:8889"
//! max_connections = 256
//!
//! [protocol]
//! settle_delay_ms = 2000
//! receive_timeout_ms = 25000
//! report_outcome = false
//!
//! [store]
//! dedup_window_ms = 0
//!
//! [database]
//! url = "postgres://postgres@localhost:5432/backup"
//! table = "sensors3"
//!
//! [api]
//! bind = "0.0.0.0:3030"
//! ```

use airsense_shared::protocol::DEFAULT_PORT;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const CONFIG_PATH_VAR: &str = "AIRSENSE_CONFIG";
pub const BIND_VAR: &str = "AIRSENSE_BIND";
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listener: ListenerConfig,
    pub protocol: ProtocolConfig,
    pub store: StoreConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address sensors connect to
    pub bind: String,
    /// Upper bound on concurrently running connection handlers
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{DEFAULT_PORT}"),
            max_connections: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Pause between the greeting and the receive wait
    pub settle_delay_ms: u64,
    /// How long to wait for the payload once the settle delay has passed
    pub receive_timeout_ms: u64,
    /// Write a status byte before closing instead of closing silently
    pub report_outcome: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 2_000,
            receive_timeout_ms: 25_000,
            report_outcome: false,
        }
    }
}

impl ProtocolConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Total time a connection may live, measured from accept
    pub fn session_lifetime(&self) -> Duration {
        self.settle_delay() + self.receive_timeout()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Suppress identical reports from one device within this window (0 = off)
    pub dedup_window_ms: u64,
}

impl StoreConfig {
    pub fn dedup_window(&self) -> Option<Duration> {
        (self.dedup_window_ms > 0).then(|| Duration::from_millis(self.dedup_window_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection string; readings are only kept in memory without it
    pub url: Option<String>,
    pub table: String,
    pub max_connections: u32,
    pub persist_timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub max_attempts: u32,
    pub queue_capacity: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            table: "sensors3".to_string(),
            max_connections: 8,
            persist_timeout_ms: 5_000,
            retry_interval_ms: 10_000,
            max_attempts: 5,
            queue_capacity: 1024,
        }
    }
}

impl DatabaseConfig {
    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address for the read-only HTTP query API (disabled when unset)
    pub bind: Option<String>,
}

impl ServerConfig {
    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load from the configured or default path, apply environment overrides
    /// and validate the result
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => {
                info!("Loading config from {} ({})", path, CONFIG_PATH_VAR);
                Self::load(&path)?
            }
            Err(_) => {
                let default_path = PathBuf::from("config").join("server.toml");
                if default_path.exists() {
                    info!("Loading config from {}", default_path.display());
                    Self::load(&default_path)?
                } else {
                    warn!("No config file found, using defaults");
                    Self::default()
                }
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup(BIND_VAR) {
            info!("{} set, listening on {}", BIND_VAR, bind);
            self.listener.bind = bind;
        }
        if let Some(url) = lookup(DATABASE_URL_VAR) {
            info!("{} set, persisting to database", DATABASE_URL_VAR);
            self.database.url = Some(url);
        }
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listener.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "listener.max_connections must be at least 1".into(),
            ));
        }
        if self.protocol.receive_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "protocol.receive_timeout_ms must be positive".into(),
            ));
        }
        if !is_sql_identifier(&self.database.table) {
            return Err(ConfigError::Invalid(format!(
                "database.table {:?} is not a plain SQL identifier",
                self.database.table
            )));
        }
        if self.database.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "database.queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Plain (optionally schema-qualified) identifier: letters, digits, underscores
pub fn is_sql_identifier(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                    part.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                }
                _ => false,
            }
        })
}
