//! Deferred indexing of stored objects
//!
//! Stored locations are queued in a [`PriorityIndexQueue`] and handed to the
//! configured [`Indexer`]s by a single [`IndexingWorker`]. Locations coming
//! from priority peers jump ahead of everything else; within a tier they are
//! indexed in submission order.

use crate::storage::StorageError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub mod queue;
pub mod worker;

pub use queue::PriorityIndexQueue;
pub use worker::{IndexingWorker, ShutdownMode, WorkerSummary};

/// A stored location waiting to be indexed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingIndexEntry {
    pub location: Url,
    pub origin_aet: String,
    pub sequence: u64,
}

impl PendingIndexEntry {
    pub fn new(location: Url, origin_aet: impl Into<String>, sequence: u64) -> Self {
        Self {
            location,
            origin_aet: origin_aet.into(),
            sequence,
        }
    }
}

/// Calling AE titles whose objects are indexed first
#[derive(Debug, Default)]
pub struct PriorityPeers {
    aets: RwLock<HashSet<String>>,
}

impl PriorityPeers {
    pub fn new<I, S>(aets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            aets: RwLock::new(aets.into_iter().map(Into::into).collect()),
        }
    }

    pub fn contains(&self, aet: &str) -> bool {
        self.aets.read().contains(aet)
    }

    pub fn snapshot(&self) -> Vec<String> {
        let mut aets: Vec<_> = self.aets.read().iter().cloned().collect();
        aets.sort();
        aets
    }

    pub(crate) fn replace(&self, aets: HashSet<String>) {
        *self.aets.write() = aets;
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to decode {location}: {reason}")]
    Decode { location: String, reason: String },

    #[error("Index database error: {0}")]
    Database(String),

    #[error("Indexing task failed: {0}")]
    Task(String),
}

/// Outcome of indexing one location
#[derive(Debug, Clone)]
pub struct IndexReport {
    pub location: Url,
    pub indexed: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Something that makes stored locations searchable
#[async_trait]
pub trait Indexer: Send + Sync {
    fn name(&self) -> &str;

    /// Index everything at `location`. Returns once indexing is complete.
    async fn index(&self, location: &Url) -> Result<IndexReport, IndexError>;
}
