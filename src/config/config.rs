use crate::access::AccessPolicy;
use crate::cache::CacheConfig;
use crate::config::{ArchiveConfig, Cli, IndexConfig, IndexingConfig, LoggingConfig};
use crate::storage::StorageConfig;
use clap::Parser;
use dimse::{DimseConfig, DimseError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Archive id must not be empty")]
    InvalidArchiveID,

    #[error("archive.thread_pool_size must be greater than 0")]
    InvalidThreadPool,

    #[error("Invalid DIMSE configuration: {0}")]
    Dimse(#[from] DimseError),

    #[error("At least one [[storage]] backend must be configured")]
    NoStorage,

    #[error("Invalid storage configuration: {0}")]
    InvalidStorage(String),

    #[error("Invalid cache configuration: {0}")]
    InvalidCache(String),

    #[error("Invalid indexing configuration: {0}")]
    InvalidIndexing(String),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level archive configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dimse: DimseConfig,
    #[serde(default)]
    pub access: AccessPolicy,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default = "default_storage")]
    pub storage: Vec<StorageConfig>,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            archive: ArchiveConfig::default(),
            logging: LoggingConfig::default(),
            dimse: DimseConfig::default(),
            access: AccessPolicy::default(),
            indexing: IndexingConfig::default(),
            storage: default_storage(),
            index: IndexConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

fn default_storage() -> Vec<StorageConfig> {
    vec![StorageConfig::default()]
}

impl Config {
    /// Load the file named on the command line
    pub fn from_args() -> Result<Self, ConfigError> {
        let cli = Cli::parse();
        Self::from_file(&cli.config_path)
    }

    /// Parse and validate a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.archive.id.trim().is_empty() {
            return Err(ConfigError::InvalidArchiveID);
        }

        self.dimse.validate()?;

        if self.storage.is_empty() {
            return Err(ConfigError::NoStorage);
        }
        for storage in &self.storage {
            if storage.backend.trim().is_empty() {
                return Err(ConfigError::InvalidStorage(
                    "backend must not be empty".to_string(),
                ));
            }
        }

        if self.cache.max_entries == 0 {
            return Err(ConfigError::InvalidCache(
                "max_entries must be greater than 0".to_string(),
            ));
        }
        if self.cache.time_to_idle_secs == 0 {
            return Err(ConfigError::InvalidCache(
                "time_to_idle_secs must be greater than 0".to_string(),
            ));
        }

        if self.indexing.shutdown_timeout_secs == 0 {
            return Err(ConfigError::InvalidIndexing(
                "shutdown_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.archive.thread_pool_size == 0 {
            return Err(ConfigError::InvalidThreadPool);
        }

        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
