use crate::indexing::ShutdownMode;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Deferred indexing behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct IndexingConfig {
    /// Calling AE titles whose objects are indexed ahead of everything else
    #[serde(default)]
    pub priority_aets: Vec<String>,

    #[serde(default)]
    pub shutdown_mode: ShutdownMode,

    /// Upper bound on waiting for the indexing worker at shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Answer C-STORE with a failure when no backend stored the object
    #[serde(default = "default_reject_unstored")]
    pub reject_unstored: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            priority_aets: Vec::new(),
            shutdown_mode: ShutdownMode::default(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            reject_unstored: default_reject_unstored(),
        }
    }
}

impl IndexingConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_shutdown_timeout() -> u64 {
    6 * 24 * 60 * 60 // 6 days
}

fn default_reject_unstored() -> bool {
    true
}

/// Embedded instance index
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            path: default_index_path(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_index_path() -> PathBuf {
    PathBuf::from("./data/index.redb")
}
