//! C6: Run Queue Manager. Wraps `storage::queue` with scope-hash derivation
//! and priority-from-trigger translation.

use anyhow::Result;

use crate::models::{QueuedRun, RunParams, RunScope, TriggeredBy};
use crate::scope::scope_hash;
use crate::storage::queue::EnqueueOutcome;
use crate::storage::Storage;

pub struct RunQueue {
    storage: Storage,
}

impl RunQueue {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn enqueue(
        &self,
        scope: &RunScope,
        params: &RunParams,
        triggered_by: TriggeredBy,
    ) -> Result<EnqueueOutcome> {
        let hash = scope_hash(scope, params);
        let scope_json = serde_json::to_value(scope)?;
        let params_json = serde_json::to_value(params)?;
        self.storage
            .enqueue_run(triggered_by.priority().as_str(), &hash, &scope_json, &params_json)
            .await
    }

    pub async fn dequeue(&self) -> Result<Option<QueuedRun>> {
        self.storage.dequeue_run().await
    }

    pub async fn mark_completed(&self, id: i64, analysis_run_id: i64) -> Result<()> {
        self.storage.mark_queued_run_completed(id, analysis_run_id).await
    }

    pub async fn mark_failed(&self, id: i64, reason: &str) -> Result<()> {
        self.storage.mark_queued_run_failed(id, reason).await
    }

    pub async fn cancel(&self, id: i64) -> Result<()> {
        self.storage.cancel_queued_run(id).await
    }

    /// Emergency stop: flip all QUEUED to CANCELLED, return the count.
    pub async fn clear_queue(&self) -> Result<i64> {
        self.storage.clear_queue().await
    }

    pub async fn status(&self) -> Result<Vec<(String, String, i64)>> {
        self.storage.queue_status_counts().await
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<QueuedRun>> {
        self.storage.queue_list(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggered_by_maps_to_expected_priority() {
        assert_eq!(TriggeredBy::Manual.priority().as_str(), "HIGH");
        assert_eq!(TriggeredBy::Scheduled.priority().as_str(), "MEDIUM");
        assert_eq!(TriggeredBy::Auto.priority().as_str(), "LOW");
    }
}
