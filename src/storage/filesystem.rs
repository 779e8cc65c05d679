use crate::decode::element_text;
use crate::storage::{DicomFile, StorageBackend, StorageError, StorageItem, StorageResult};
use async_trait::async_trait;
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use url::Url;
use walkdir::WalkDir;

const UNKNOWN_INSTITUTION: &str = "UN_IN";
const UNKNOWN_MODALITY: &str = "UN_MODALITY";
const UNKNOWN_DATE: &str = "UN_DATE";
const UNKNOWN_ACCESSION: &str = "UN_ACC";

/// Filesystem-based storage backend
///
/// Objects are laid out under the root as
/// `institution/modality/yyyy/mm/dd/accession/<SOPInstanceUID>.dcm`, with a
/// `.gz` suffix when compression is enabled. Locations are `file://` URLs.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    name: String,
    root_path: PathBuf,
    gzip: bool,
}

impl FilesystemStorage {
    /// Create a new filesystem storage backend with the given root path
    pub fn new<P: AsRef<Path>>(root_path: P) -> StorageResult<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        if !root_path.exists() {
            std::fs::create_dir_all(&root_path).map_err(|e| {
                StorageError::Config(format!(
                    "Failed to create storage root directory '{}': {}",
                    root_path.display(),
                    e
                ))
            })?;
        }

        // file:// URLs need an absolute path. Joining onto the working
        // directory keeps symlinks unresolved.
        let root_path = if root_path.is_absolute() {
            root_path
        } else {
            std::env::current_dir()?.join(root_path)
        };

        Ok(Self {
            name: "filesystem".to_string(),
            root_path,
            gzip: false,
        })
    }

    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.root_path
    }

    /// Location of the storage root, with a trailing slash
    pub fn root_location(&self) -> StorageResult<Url> {
        Url::from_directory_path(&self.root_path)
            .map_err(|_| StorageError::Path(self.root_path.display().to_string()))
    }

    /// Build a path under the storage root
    pub fn subpath_str(&self, rel: &str) -> PathBuf {
        self.root_path.join(rel)
    }

    /// Relative path an object is written to
    pub fn relative_path(&self, object: &DicomFile) -> StorageResult<PathBuf> {
        let sop_instance_uid = text(object, tags::SOP_INSTANCE_UID)
            .or_else(|| {
                let uid = object.meta().media_storage_sop_instance_uid();
                let uid = uid.trim_end_matches('\0').trim();
                (!uid.is_empty()).then(|| uid.to_string())
            })
            .ok_or_else(|| StorageError::Path("object has no SOPInstanceUID".to_string()))?;

        let institution = text(object, tags::INSTITUTION_NAME)
            .map(|s| s.replace([' ', '.', '&'], ""))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| UNKNOWN_INSTITUTION.to_string());

        let modality =
            text(object, tags::MODALITY).unwrap_or_else(|| UNKNOWN_MODALITY.to_string());

        let mut path = PathBuf::new();
        path.push(sanitize(&institution));
        path.push(sanitize(&modality));

        match text(object, tags::STUDY_DATE).and_then(|d| date_segments(&d)) {
            Some([year, month, day]) => {
                path.push(sanitize(&year));
                path.push(sanitize(&month));
                path.push(sanitize(&day));
            }
            None => path.push(UNKNOWN_DATE),
        }

        let grouping = text(object, tags::ACCESSION_NUMBER)
            .or_else(|| text(object, tags::PATIENT_NAME))
            .or_else(|| text(object, tags::STUDY_INSTANCE_UID))
            .unwrap_or_else(|| UNKNOWN_ACCESSION.to_string());
        path.push(sanitize(&grouping));

        let mut file_name = format!("{}.dcm", sanitize(&sop_instance_uid));
        if self.gzip {
            file_name.push_str(".gz");
        }
        path.push(file_name);

        Ok(path)
    }

    /// Write bytes to a path relative to the storage root, creating parents
    ///
    /// Paths that would leave the storage root are refused.
    pub async fn write_file_str(&self, rel: &str, data: &[u8]) -> StorageResult<PathBuf> {
        let escapes = Path::new(rel)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if rel.is_empty() || escapes {
            return Err(StorageError::Path(format!(
                "'{}' is not a path below the storage root",
                rel
            )));
        }
        let path = self.subpath_str(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    fn encode(&self, object: &DicomFile) -> StorageResult<Vec<u8>> {
        let mut raw = Vec::new();
        object
            .write_all(&mut raw)
            .map_err(|e| StorageError::Encode(e.to_string()))?;

        if !self.gzip {
            return Ok(raw);
        }

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }

    fn local_path(&self, location: &Url) -> StorageResult<PathBuf> {
        self.ensure_handles(location)?;
        location
            .to_file_path()
            .map_err(|_| StorageError::Path(location.to_string()))
    }
}

#[async_trait]
impl StorageBackend for FilesystemStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> &str {
        "file"
    }

    async fn store(&self, object: &DicomFile) -> StorageResult<Option<Url>> {
        let relative = self.relative_path(object)?;
        let data = self.encode(object)?;
        let path = self
            .write_file_str(&relative.to_string_lossy(), &data)
            .await?;

        tracing::debug!(
            storage = %self.name,
            "Stored {} bytes at {}",
            data.len(),
            path.display()
        );

        Url::from_file_path(&path)
            .map(Some)
            .map_err(|_| StorageError::Path(path.display().to_string()))
    }

    async fn remove(&self, location: &Url) -> StorageResult<()> {
        let path = self.local_path(location)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(location.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn at(&self, location: &Url) -> StorageResult<Vec<StorageItem>> {
        let path = self.local_path(location)?;
        if !path.exists() {
            return Err(StorageError::NotFound(location.to_string()));
        }

        if path.is_file() {
            return Ok(vec![StorageItem::file(location.clone(), path)]);
        }

        let items = tokio::task::spawn_blocking(move || {
            WalkDir::new(&path)
                .follow_links(false)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| {
                    let path = entry.into_path();
                    Url::from_file_path(&path)
                        .ok()
                        .map(|location| StorageItem::file(location, path))
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

        Ok(items)
    }

    async fn list(&self, location: &Url) -> StorageResult<BoxStream<'static, Url>> {
        let path = self.local_path(location)?;
        if !path.is_dir() {
            return Err(StorageError::NotDirectory(location.to_string()));
        }

        let mut children = Vec::new();
        let mut entries = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let child = entry.path();
            let url = if entry.file_type().await?.is_dir() {
                Url::from_directory_path(&child)
            } else {
                Url::from_file_path(&child)
            };
            match url {
                Ok(url) => children.push(url),
                Err(_) => tracing::warn!("Skipping unrepresentable path {}", child.display()),
            }
        }
        children.sort();

        Ok(stream::iter(children).boxed())
    }
}

fn text(object: &DicomFile, tag: Tag) -> Option<String> {
    element_text(object, tag)
}

/// Keep a DICOM value from escaping its path segment
/// `yyyy`, `mm`, `dd` from a DA value; `None` unless it starts with 8 digits
fn date_segments(date: &str) -> Option<[String; 3]> {
    let digits = date.get(0..8)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some([
        digits[0..4].to_string(),
        digits[4..6].to_string(),
        digits[6..8].to_string(),
    ])
}

fn sanitize(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '^' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
