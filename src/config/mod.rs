//! Relay configuration.
//!
//! Loaded from YAML files and environment variables into a single
//! `RelayConfig`, constructed once at process startup.

use serde::Deserialize;

pub use crate::store::Durability;
use crate::origin::DEFAULT_KEY_PREFIX;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "relay.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RELAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RELAY_LOG";

/// Default store host.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default store port (PostgreSQL service port).
pub const DEFAULT_PORT: u16 = 5432;
/// Default database name.
pub const DEFAULT_DATABASE: &str = "socketio_relay";
/// Default relay table name.
pub const DEFAULT_TABLE: &str = "messages";

/// Errors raised while building configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid store URI '{0}': expected host[:port]")]
    InvalidUri(String),

    #[error("Invalid port '{0}'")]
    InvalidPort(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Log store connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store host.
    pub host: String,
    /// Store port.
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Username (optional).
    pub user: Option<String>,
    /// Password (optional).
    pub password: Option<String>,
    /// Relay table name.
    pub table: String,
    /// Full connection URL. Overrides host, port, database and credentials.
    pub url: Option<String>,
    /// Pool size.
    pub max_connections: u32,
    /// Seconds to wait for a pooled connection.
    pub acquire_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            database: DEFAULT_DATABASE.to_string(),
            user: None,
            password: None,
            table: DEFAULT_TABLE.to_string(),
            url: None,
            max_connections: 10,
            acquire_timeout_secs: 30,
        }
    }
}

impl StoreConfig {
    /// Apply a `host[:port]` URI on top of this configuration.
    pub fn apply_uri(&mut self, uri: &str) -> Result<(), ConfigError> {
        let mut parts = uri.split(':');
        let host = parts.next().unwrap_or_default();
        let port = parts.next();
        if host.is_empty() || parts.next().is_some() {
            return Err(ConfigError::InvalidUri(uri.to_string()));
        }

        let port = port
            .map(|port| {
                port.parse::<u16>()
                    .map_err(|_| ConfigError::InvalidPort(port.to_string()))
            })
            .transpose()?;

        self.host = host.to_string();
        if let Some(port) = port {
            self.port = port;
        }
        Ok(())
    }
}

/// Process-wide relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Log store connection.
    pub store: StoreConfig,
    /// Keep relay records after publishing instead of deleting them.
    pub save_messages: bool,
    /// Acknowledgment strength for inserts and deletes.
    pub durability: Durability,
    /// Prefix of this process's origin tag.
    pub key_prefix: String,
    /// Namespaces a host should bind adapters to.
    pub namespaces: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            save_messages: false,
            durability: Durability::Soft,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            namespaces: vec!["/".to_string()],
        }
    }
}

impl RelayConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `relay.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("namespaces")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests;
