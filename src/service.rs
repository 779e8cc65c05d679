use crate::access::AccessGate;
use crate::decode::decode_dataset;
use crate::indexing::PriorityIndexQueue;
use crate::status::{decode_failure_status, is_retriable_status, unstored_status};
use crate::storage::StorageRouter;
use async_trait::async_trait;
use dimse::{DimseStatus, StoreProvider, StoreRequest};
use std::sync::Arc;

/// C-STORE handling behind the listener: decode, store on every backend,
/// queue each stored location for indexing.
pub struct StoreService {
    gate: AccessGate,
    router: Arc<StorageRouter>,
    queue: Arc<PriorityIndexQueue>,
    reject_unstored: bool,
}

impl StoreService {
    pub fn new(gate: AccessGate, router: Arc<StorageRouter>, queue: Arc<PriorityIndexQueue>) -> Self {
        Self {
            gate,
            router,
            queue,
            reject_unstored: true,
        }
    }

    pub fn with_reject_unstored(mut self, reject_unstored: bool) -> Self {
        self.reject_unstored = reject_unstored;
        self
    }
}

#[async_trait]
impl StoreProvider for StoreService {
    fn authorize(&self, calling_aet: &str) -> bool {
        self.gate.authorize(calling_aet)
    }

    async fn store(&self, calling_aet: &str, request: StoreRequest) -> DimseStatus {
        let sop_instance_uid = request.dataset.metadata().sop_instance_uid.clone();
        let dataset = request.dataset;

        let object = match tokio::task::spawn_blocking(move || decode_dataset(&dataset)).await {
            Ok(Ok(object)) => Arc::new(object),
            Ok(Err(e)) => {
                tracing::warn!(
                    calling_aet,
                    "Rejecting {}: failed to decode data set: {}",
                    sop_instance_uid,
                    e
                );
                return decode_failure_status();
            }
            Err(e) => {
                tracing::error!("Decode task for {} failed: {}", sop_instance_uid, e);
                return DimseStatus::PROCESSING_FAILURE;
            }
        };

        let locations = self.router.store(object).await;
        if locations.is_empty() {
            let status = unstored_status(self.reject_unstored);
            tracing::warn!(
                calling_aet,
                retriable = is_retriable_status(&status),
                "No storage backend accepted {}",
                sop_instance_uid
            );
            return status;
        }

        for location in locations {
            let sequence = self.queue.submit(location.clone(), calling_aet);
            tracing::debug!(
                calling_aet,
                sequence,
                "Queued {} for indexing",
                location
            );
        }

        tracing::info!(calling_aet, "Stored {}", sop_instance_uid);
        DimseStatus::Success
    }
}
