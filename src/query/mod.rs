use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

pub mod redb_index;

pub use redb_index::{IndexedInstance, RedbIndex};

/// Attributes a query expression may filter on
pub const QUERYABLE_FIELDS: &[&str] = &[
    "SOPInstanceUID",
    "SeriesInstanceUID",
    "StudyInstanceUID",
    "PatientID",
    "Modality",
];

#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("Invalid query expression '{0}', expected Field:value")]
    InvalidExpression(String),

    #[error("Field '{0}' cannot be queried")]
    UnsupportedField(String),

    #[error("Query backend error: {0}")]
    Backend(String),
}

/// One hit from a query provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub location: Url,
    pub score: f32,
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

/// A parsed `Field:value` expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryExpression {
    pub field: String,
    pub value: String,
}

impl QueryExpression {
    pub fn parse(expression: &str) -> Result<Self, QueryError> {
        let (field, value) = expression
            .split_once(':')
            .ok_or_else(|| QueryError::InvalidExpression(expression.to_string()))?;
        let (field, value) = (field.trim(), value.trim());

        if field.is_empty() || value.is_empty() {
            return Err(QueryError::InvalidExpression(expression.to_string()));
        }
        if !QUERYABLE_FIELDS.contains(&field) {
            return Err(QueryError::UnsupportedField(field.to_string()));
        }

        Ok(Self {
            field: field.to_string(),
            value: value.to_string(),
        })
    }
}

/// Something that can answer `Field:value` queries with stored locations
#[async_trait]
pub trait QueryProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn query(&self, expression: &str) -> Result<Vec<SearchResult>, QueryError>;
}
