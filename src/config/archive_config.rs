use serde::Deserialize;

/// Represents the configuration for the archive process
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    pub id: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Runtime worker threads
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            id: "archivist".to_string(),
            log_level: default_log_level(),
            thread_pool_size: default_thread_pool_size(),
        }
    }
}

/// Default log level for the archive configuration
fn default_log_level() -> String {
    "info".to_string()
}

fn default_thread_pool_size() -> usize {
    10
}
