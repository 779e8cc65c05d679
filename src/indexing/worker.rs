use crate::indexing::{Indexer, PendingIndexEntry, PriorityIndexQueue};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What happens to queued entries when the worker is told to stop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Finish the entry in flight and abandon the rest
    #[default]
    FailFast,
    /// Finish the entry in flight, then index everything still queued
    Drain,
}

/// Counters reported when the worker stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub indexed: u64,
    pub failed: u64,
    pub abandoned: usize,
}

/// Single consumer of the indexing queue
pub struct IndexingWorker {
    queue: Arc<PriorityIndexQueue>,
    indexers: Vec<Arc<dyn Indexer>>,
    mode: ShutdownMode,
}

impl IndexingWorker {
    pub fn new(queue: Arc<PriorityIndexQueue>, indexers: Vec<Arc<dyn Indexer>>) -> Self {
        Self {
            queue,
            indexers,
            mode: ShutdownMode::default(),
        }
    }

    pub fn with_shutdown_mode(mut self, mode: ShutdownMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<WorkerSummary> {
        tokio::spawn(self.run(shutdown))
    }

    /// Index entries one at a time until `shutdown` fires.
    ///
    /// Cancellation is only observed between entries; an index call that has
    /// started always runs to completion.
    pub async fn run(self, shutdown: CancellationToken) -> WorkerSummary {
        tracing::info!(
            indexers = self.indexers.len(),
            mode = ?self.mode,
            "Indexing worker started"
        );
        let mut summary = WorkerSummary::default();

        loop {
            let entry = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                entry = self.queue.pop() => entry,
            };
            self.process(&entry, &mut summary).await;
        }

        match self.mode {
            ShutdownMode::Drain => {
                let pending = self.queue.len();
                if pending > 0 {
                    tracing::info!("Draining {} queued entries before stopping", pending);
                }
                while let Some(entry) = self.queue.try_pop() {
                    self.process(&entry, &mut summary).await;
                }
            }
            ShutdownMode::FailFast => {
                summary.abandoned = self.queue.len();
                if summary.abandoned > 0 {
                    tracing::warn!(
                        "Indexing worker stopping with {} entries left unindexed",
                        summary.abandoned
                    );
                }
            }
        }

        tracing::info!(
            indexed = summary.indexed,
            failed = summary.failed,
            abandoned = summary.abandoned,
            "Indexing worker stopped"
        );
        summary
    }

    async fn process(&self, entry: &PendingIndexEntry, summary: &mut WorkerSummary) {
        let started = Instant::now();
        let mut ok = true;

        for indexer in &self.indexers {
            let outcome = AssertUnwindSafe(indexer.index(&entry.location))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(report)) => {
                    tracing::debug!(
                        indexer = indexer.name(),
                        sequence = entry.sequence,
                        "Indexed {} ({} items, {} failed) in {:?}",
                        report.location,
                        report.indexed,
                        report.failed,
                        report.elapsed
                    );
                }
                Ok(Err(e)) => {
                    ok = false;
                    tracing::error!(
                        indexer = indexer.name(),
                        "Failed to index {}: {}",
                        entry.location,
                        e
                    );
                }
                Err(_) => {
                    ok = false;
                    tracing::error!(
                        indexer = indexer.name(),
                        "Indexer panicked on {}",
                        entry.location
                    );
                }
            }
        }

        if ok {
            summary.indexed += 1;
        } else {
            summary.failed += 1;
        }
        tracing::trace!(
            "Finished {} from {} in {:?}",
            entry.location,
            entry.origin_aet,
            started.elapsed()
        );
    }
}
