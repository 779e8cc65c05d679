use crate::decode::{element_text, read_header};
use crate::indexing::{IndexError, IndexReport, Indexer};
use crate::query::{QueryError, QueryExpression, QueryProvider, SearchResult};
use crate::storage::{DicomFile, StorageRouter};
use async_trait::async_trait;
use dicom_dictionary_std::tags;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use url::Url;

/// Indexed attributes of one stored instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedInstance {
    pub location: String,
    pub sop_instance_uid: String,
    pub sop_class_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    pub study_instance_uid: Option<String>,
    pub patient_id: Option<String>,
    pub modality: Option<String>,
    pub indexed_at: u64, // Unix timestamp
}

impl IndexedInstance {
    pub fn from_object(location: &Url, object: &DicomFile) -> Option<Self> {
        let sop_instance_uid = element_text(object, tags::SOP_INSTANCE_UID).or_else(|| {
            let uid = object.meta().media_storage_sop_instance_uid().trim();
            (!uid.is_empty()).then(|| uid.to_string())
        })?;

        Some(Self {
            location: location.to_string(),
            sop_instance_uid,
            sop_class_uid: element_text(object, tags::SOP_CLASS_UID),
            series_instance_uid: element_text(object, tags::SERIES_INSTANCE_UID),
            study_instance_uid: element_text(object, tags::STUDY_INSTANCE_UID),
            patient_id: element_text(object, tags::PATIENT_ID),
            modality: element_text(object, tags::MODALITY),
            indexed_at: current_timestamp(),
        })
    }

    /// Queryable fields carried by this record
    fn fields(&self) -> Vec<(&'static str, &str)> {
        let mut fields = vec![("SOPInstanceUID", self.sop_instance_uid.as_str())];
        let optional = [
            ("SeriesInstanceUID", &self.series_instance_uid),
            ("StudyInstanceUID", &self.study_instance_uid),
            ("PatientID", &self.patient_id),
            ("Modality", &self.modality),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                fields.push((name, value.as_str()));
            }
        }
        fields
    }

    fn into_result(self) -> Result<SearchResult, QueryError> {
        let location = Url::parse(&self.location)
            .map_err(|e| QueryError::Backend(format!("Bad location in index: {}", e)))?;
        let fields: HashMap<String, String> = self
            .fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Ok(SearchResult {
            location,
            score: 1.0,
            fields,
        })
    }
}

// Define redb tables
const INSTANCES_BY_LOCATION: TableDefinition<&str, &str> =
    TableDefinition::new("instances_by_location");
const LOCATIONS_BY_FIELD: TableDefinition<&str, &str> = TableDefinition::new("locations_by_field");

const KEY_SEPARATOR: char = '\u{1f}';

fn field_key(field: &str, value: &str, location: &str) -> String {
    format!("{field}{KEY_SEPARATOR}{value}{KEY_SEPARATOR}{location}")
}

fn field_prefix(field: &str, value: &str) -> String {
    format!("{field}{KEY_SEPARATOR}{value}{KEY_SEPARATOR}")
}

/// Embedded instance index, backed by redb.
///
/// Serves both as an [`Indexer`] (reading stored objects through the storage
/// router) and as a [`QueryProvider`] over the indexed attributes.
pub struct RedbIndex {
    db: Arc<Database>,
    storage: Arc<StorageRouter>,
}

impl RedbIndex {
    /// Open or create the index database
    pub fn open(db_path: &Path, storage: Arc<StorageRouter>) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                IndexError::Database(format!("Failed to create index directory: {}", e))
            })?;
        }

        let db = Database::create(db_path)
            .map_err(|e| IndexError::Database(format!("Failed to open index database: {}", e)))?;

        let write_txn = db.begin_write().map_err(|e| {
            IndexError::Database(format!("Failed to begin write transaction: {}", e))
        })?;
        {
            let _ = write_txn
                .open_table(INSTANCES_BY_LOCATION)
                .map_err(|e| IndexError::Database(format!("Failed to open instances table: {}", e)))?;
            let _ = write_txn
                .open_table(LOCATIONS_BY_FIELD)
                .map_err(|e| IndexError::Database(format!("Failed to open fields table: {}", e)))?;
        }
        write_txn.commit().map_err(|e| {
            IndexError::Database(format!("Failed to commit table initialization: {}", e))
        })?;

        Ok(Self {
            db: Arc::new(db),
            storage,
        })
    }

    /// Insert or replace the record for an instance location
    pub fn record(&self, instance: &IndexedInstance) -> Result<(), IndexError> {
        record_instance(&self.db, instance)
    }

    /// Records matching a parsed expression
    pub fn search(&self, expression: &QueryExpression) -> Result<Vec<IndexedInstance>, QueryError> {
        search_instances(&self.db, expression)
    }

    /// Drop the record for a location, if any
    pub fn remove(&self, location: &Url) -> Result<bool, IndexError> {
        let write_txn = self.db.begin_write().map_err(db_err)?;
        let removed = {
            let mut instances = write_txn.open_table(INSTANCES_BY_LOCATION).map_err(db_err)?;
            let mut fields = write_txn.open_table(LOCATIONS_BY_FIELD).map_err(db_err)?;
            let previous = instances
                .remove(location.as_str())
                .map_err(db_err)?
                .map(|v| v.value().to_string());
            match previous {
                Some(json) => {
                    remove_field_keys(&mut fields, &json)?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit().map_err(db_err)?;
        Ok(removed)
    }

    /// Number of indexed instances
    pub fn len(&self) -> Result<u64, IndexError> {
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let table = read_txn.open_table(INSTANCES_BY_LOCATION).map_err(db_err)?;
        table.len().map_err(db_err)
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.len()? == 0)
    }
}

fn db_err(e: impl std::fmt::Display) -> IndexError {
    IndexError::Database(e.to_string())
}

fn record_instance(db: &Database, instance: &IndexedInstance) -> Result<(), IndexError> {
    let json = serde_json::to_string(instance)
        .map_err(|e| IndexError::Database(format!("Failed to serialize instance: {}", e)))?;

    let write_txn = db.begin_write().map_err(db_err)?;
    {
        let mut instances = write_txn.open_table(INSTANCES_BY_LOCATION).map_err(db_err)?;
        let mut fields = write_txn.open_table(LOCATIONS_BY_FIELD).map_err(db_err)?;

        // Re-indexing a location replaces its field keys
        let previous = instances
            .insert(instance.location.as_str(), json.as_str())
            .map_err(db_err)?
            .map(|v| v.value().to_string());
        if let Some(previous) = previous {
            remove_field_keys(&mut fields, &previous)?;
        }

        for (field, value) in instance.fields() {
            let key = field_key(field, value, &instance.location);
            fields
                .insert(key.as_str(), instance.location.as_str())
                .map_err(db_err)?;
        }
    }
    write_txn.commit().map_err(db_err)?;

    tracing::debug!(
        "📇 Indexed instance: sop_instance_uid={}, location={}",
        instance.sop_instance_uid,
        instance.location
    );
    Ok(())
}

fn remove_field_keys(
    fields: &mut redb::Table<'_, &'static str, &'static str>,
    previous_json: &str,
) -> Result<(), IndexError> {
    let previous: IndexedInstance = serde_json::from_str(previous_json)
        .map_err(|e| IndexError::Database(format!("Failed to deserialize instance: {}", e)))?;
    for (field, value) in previous.fields() {
        let key = field_key(field, value, &previous.location);
        fields.remove(key.as_str()).map_err(db_err)?;
    }
    Ok(())
}

fn search_instances(
    db: &Database,
    expression: &QueryExpression,
) -> Result<Vec<IndexedInstance>, QueryError> {
    let backend = |e: &dyn std::fmt::Display| QueryError::Backend(e.to_string());

    let read_txn = db.begin_read().map_err(|e| backend(&e))?;
    let fields = read_txn
        .open_table(LOCATIONS_BY_FIELD)
        .map_err(|e| backend(&e))?;
    let instances = read_txn
        .open_table(INSTANCES_BY_LOCATION)
        .map_err(|e| backend(&e))?;

    let prefix = field_prefix(&expression.field, &expression.value);
    let mut results = Vec::new();

    for entry in fields
        .range(prefix.as_str()..)
        .map_err(|e| backend(&e))?
    {
        let (key, location) = entry.map_err(|e| backend(&e))?;
        if !key.value().starts_with(&prefix) {
            break;
        }
        if let Some(json) = instances
            .get(location.value())
            .map_err(|e| backend(&e))?
        {
            let instance: IndexedInstance = serde_json::from_str(json.value())
                .map_err(|e| QueryError::Backend(format!("Failed to deserialize instance: {}", e)))?;
            results.push(instance);
        }
    }

    tracing::debug!(
        "📇 Found {} instances for {}:{}",
        results.len(),
        expression.field,
        expression.value
    );
    Ok(results)
}

#[async_trait]
impl Indexer for RedbIndex {
    fn name(&self) -> &str {
        "redb"
    }

    async fn index(&self, location: &Url) -> Result<IndexReport, IndexError> {
        let started = Instant::now();
        let items = self.storage.resolve(location).await?;

        let mut report = IndexReport {
            location: location.clone(),
            indexed: 0,
            failed: 0,
            elapsed: Default::default(),
        };
        let mut last_error = None;

        for item in items {
            let item_location = item.location().clone();
            let db = Arc::clone(&self.db);

            let outcome = tokio::task::spawn_blocking(move || {
                let reader = item.open().map_err(|e| e.to_string())?;
                let object = read_header(reader).map_err(|e| e.to_string())?;
                match IndexedInstance::from_object(&item_location, &object) {
                    Some(instance) => record_instance(&db, &instance).map_err(|e| e.to_string()),
                    None => Err(format!("{} has no SOPInstanceUID", item_location)),
                }
            })
            .await
            .map_err(|e| IndexError::Task(e.to_string()))?;

            match outcome {
                Ok(()) => report.indexed += 1,
                Err(reason) => {
                    tracing::warn!("Skipping unreadable item under {}: {}", location, reason);
                    report.failed += 1;
                    last_error = Some(reason);
                }
            }
        }

        report.elapsed = started.elapsed();
        match last_error {
            Some(reason) if report.indexed == 0 => Err(IndexError::Decode {
                location: location.to_string(),
                reason,
            }),
            _ => Ok(report),
        }
    }
}

#[async_trait]
impl QueryProvider for RedbIndex {
    fn name(&self) -> &str {
        "redb"
    }

    async fn query(&self, expression: &str) -> Result<Vec<SearchResult>, QueryError> {
        let expression = QueryExpression::parse(expression)?;
        let db = Arc::clone(&self.db);

        let instances = tokio::task::spawn_blocking(move || search_instances(&db, &expression))
            .await
            .map_err(|e| QueryError::Backend(e.to_string()))??;

        instances
            .into_iter()
            .map(IndexedInstance::into_result)
            .collect()
    }
}

/// Helper to get current Unix timestamp
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
