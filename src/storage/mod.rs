use async_trait::async_trait;
use bytes::Bytes;
use dicom_object::{FileDicomObject, InMemDicomObject};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

pub mod filesystem;
pub mod router;

pub use filesystem::FilesystemStorage;
pub use router::StorageRouter;

/// A received DICOM object with its file meta group
pub type DicomFile = FileDicomObject<InMemDicomObject>;

/// Error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path error: {0}")]
    Path(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Storage '{backend}' does not handle location {location}")]
    SchemeMismatch { backend: String, location: String },

    #[error("No storage backend handles scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("Storage '{0}' does not support directory listing")]
    ListingUnsupported(String),

    #[error("Nothing stored at {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Where the bytes of a stored item live
#[derive(Debug, Clone)]
enum ItemSource {
    File(PathBuf),
    Memory(Bytes),
}

/// A readable item found at a storage location
#[derive(Debug, Clone)]
pub struct StorageItem {
    location: Url,
    source: ItemSource,
}

impl StorageItem {
    pub fn file(location: Url, path: PathBuf) -> Self {
        Self {
            location,
            source: ItemSource::File(path),
        }
    }

    pub fn memory(location: Url, data: Bytes) -> Self {
        Self {
            location,
            source: ItemSource::Memory(data),
        }
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    /// Whether the stored bytes are gzip-compressed
    pub fn is_gzip(&self) -> bool {
        self.location.path().ends_with(".gz")
    }

    /// Open the item for reading, decompressing `.gz` items transparently
    pub fn open(&self) -> std::io::Result<Box<dyn Read + Send>> {
        let raw: Box<dyn Read + Send> = match &self.source {
            ItemSource::File(path) => Box::new(std::io::BufReader::with_capacity(
                8192,
                std::fs::File::open(path)?,
            )),
            ItemSource::Memory(data) => Box::new(std::io::Cursor::new(data.clone())),
        };
        if self.is_gzip() {
            Ok(Box::new(flate2::read::GzDecoder::new(raw)))
        } else {
            Ok(raw)
        }
    }

    /// Read the whole (decompressed) item
    pub fn read_all(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.open()?.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Storage backend trait
///
/// A backend owns one URL scheme. The router only hands a backend locations
/// carrying that scheme; backends reject anything else with
/// [`StorageError::SchemeMismatch`].
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Human-readable name used in logs
    fn name(&self) -> &str;

    /// URL scheme of the locations this backend produces
    fn scheme(&self) -> &str;

    /// Whether this backend is in charge of `location`
    fn handles(&self, location: &Url) -> bool {
        location.scheme() == self.scheme()
    }

    /// Fail with [`StorageError::SchemeMismatch`] unless this backend handles `location`
    fn ensure_handles(&self, location: &Url) -> StorageResult<()> {
        if self.handles(location) {
            Ok(())
        } else {
            Err(StorageError::SchemeMismatch {
                backend: self.name().to_string(),
                location: location.to_string(),
            })
        }
    }

    /// Persist an object. `Ok(None)` means the backend chose not to store it.
    async fn store(&self, object: &DicomFile) -> StorageResult<Option<Url>>;

    /// Remove whatever is stored at `location`
    async fn remove(&self, location: &Url) -> StorageResult<()>;

    /// All items at `location`, recursing into sub-locations
    async fn at(&self, location: &Url) -> StorageResult<Vec<StorageItem>>;

    /// The item stored at exactly `location`
    async fn get(&self, location: &Url) -> StorageResult<Option<StorageItem>> {
        Ok(self
            .at(location)
            .await?
            .into_iter()
            .next()
            .filter(|item| item.location() == location))
    }

    /// Direct children of `location`; directories carry a trailing slash
    async fn list(&self, location: &Url) -> StorageResult<BoxStream<'static, Url>> {
        self.ensure_handles(location)?;
        Err(StorageError::ListingUnsupported(self.name().to_string()))
    }
}

/// Configuration for one storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub options: std::collections::HashMap<String, serde_json::Value>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let mut options = std::collections::HashMap::new();
        options.insert(
            "path".to_string(),
            serde_json::Value::String("./data/storage".to_string()),
        );

        Self {
            backend: default_backend(),
            name: None,
            options,
        }
    }
}

fn default_backend() -> String {
    "filesystem".to_string()
}

/// Create a storage backend from configuration
pub fn create_storage_backend(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    match config.backend.as_str() {
        "filesystem" => {
            let path = config
                .options
                .get("path")
                .and_then(|v| v.as_str())
                .unwrap_or("./data/storage");
            let gzip = config
                .options
                .get("gzip")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            let mut storage = FilesystemStorage::new(path)?.with_gzip(gzip);
            if let Some(name) = &config.name {
                storage = storage.with_name(name.clone());
            }
            Ok(Arc::new(storage))
        }
        _ => Err(StorageError::Config(format!(
            "Unknown storage backend: {}",
            config.backend
        ))),
    }
}
