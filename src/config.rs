//! Application configuration.
//!
//! Loaded from YAML files or `RELUX`-prefixed environment variables.

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RELUX_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RELUX";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RELUX_LOG";

/// Default depth of the subscriber notification queue.
pub const DEFAULT_NOTIFY_QUEUE_DEPTH: usize = 256;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Depth of the bounded subscriber notification queue.
    pub notify_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            notify_queue_depth: DEFAULT_NOTIFY_QUEUE_DEPTH,
        }
    }
}

/// Storage type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// In-memory storage, no persistence.
    Memory,
    /// SQLite storage.
    #[default]
    Sqlite,
    /// PostgreSQL storage.
    Postgres,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// SQLite database path (`:memory:` for in-memory).
    pub path: String,
    /// PostgreSQL connection URI.
    pub uri: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::default(),
            path: "relux.db".to_string(),
            uri: "postgres://localhost:5432/relux".to_string(),
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("failed to load config: {0}")]
    Load(String),
}

impl Config {
    /// Load configuration, layering sources (later wins):
    ///
    /// 1. `config.yaml` in the current directory, if present
    /// 2. An explicit file path, if given
    /// 3. The file named by `RELUX_CONFIG`, if set
    /// 4. `RELUX`-prefixed environment variables (`__` separator)
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

        let loaded = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        loaded
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))
    }

    /// Parse configuration directly from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}
