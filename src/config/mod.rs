use clap::Parser;

mod archive_config;
mod indexing_config;
mod logging_config;
pub mod config;

pub use archive_config::ArchiveConfig;
pub use config::{Config, ConfigError};
pub use indexing_config::{IndexConfig, IndexingConfig};
pub use logging_config::LoggingConfig;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "archivist", about = "DICOM storage archive", version)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value = "config.toml")]
    pub config_path: String,
}
