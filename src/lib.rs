pub mod access;
pub mod cache;
pub mod config;
pub mod decode;
pub mod globals;
pub mod indexing;
pub mod query;
pub mod server;
pub mod service;
pub mod status;
pub mod storage;

use crate::cache::{IndexedMetadataLoader, MetadataCache};
use crate::config::Config;
use crate::indexing::Indexer;
use crate::query::RedbIndex;
use crate::server::ArchiveServer;
use crate::storage::{create_storage_backend, StorageRouter};
use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Install the tracing subscriber described by the config.
///
/// `RUST_LOG` overrides `archive.log_level` when set.
pub fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.archive.log_level))
        .context("invalid log level")?;

    if config.logging.log_to_file {
        let file = std::fs::File::create(&config.logging.log_file_path).with_context(|| {
            format!("failed to create log file {}", config.logging.log_file_path)
        })?;

        // Create a file appender
        let file_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_writer(Arc::new(file));

        // Create a stdout appender
        let stdout_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_appender)
            .with(stdout_appender)
            .try_init()
            .context("failed to initialize logging")?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;
    }
    Ok(())
}

/// Run the archive until ctrl-c
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_logging(&config)?;
    tracing::info!("🔧 Starting archive '{}'", config.archive.id);

    let mut router = StorageRouter::default();
    for storage in &config.storage {
        let backend = create_storage_backend(storage)
            .with_context(|| format!("failed to create '{}' storage", storage.backend))?;
        tracing::info!("Registered storage backend '{}'", backend.name());
        router.register(backend);
    }
    let router = Arc::new(router);

    let mut indexers: Vec<Arc<dyn Indexer>> = Vec::new();
    let background = CancellationToken::new();
    let mut sweeper = None;

    if config.index.enabled {
        let index = Arc::new(
            RedbIndex::open(&config.index.path, Arc::clone(&router))
                .context("failed to open instance index")?,
        );
        indexers.push(index.clone());

        let loader = IndexedMetadataLoader::new(index, Arc::clone(&router));
        let cache = MetadataCache::new(&config.cache, Arc::new(loader)).install()?;
        sweeper = cache.spawn_sweeper(background.clone());
    } else {
        tracing::warn!("Instance index disabled; stored objects will not be indexed");
    }

    let handle = ArchiveServer::new(&config, router, indexers).start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutdown requested");

    let summary = handle.shutdown().await?;
    background.cancel();
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }

    tracing::info!(
        "Archive '{}' stopped: {} indexed, {} failed, {} left unindexed",
        config.archive.id,
        summary.indexed,
        summary.failed,
        summary.abandoned
    );
    Ok(())
}
