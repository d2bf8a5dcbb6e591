use tracing::debug;

use super::record::{ActionPayload, RecordId, SyncRecord};
use super::store::{StoreError, TaskStore};

/// What happened to a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The record is gone from the journal.
    Removed,
    /// A request is in flight; the cancel applies once its event is handled.
    Deferred,
}

/// Persisted, append-only journal of sync records for one partition.
#[derive(Debug, Clone)]
pub struct SyncQueue {
    store: TaskStore,
    partition_id: String,
}

impl SyncQueue {
    pub fn new(store: TaskStore, partition_id: impl Into<String>) -> Self {
        Self {
            store,
            partition_id: partition_id.into(),
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Stores a new `pending` record and returns it with its id.
    pub async fn enqueue(&self, payload: &ActionPayload) -> Result<SyncRecord, StoreError> {
        let record = self.store.insert_record(&self.partition_id, payload).await?;
        debug!(
            record_id = record.record_id,
            action = record.action.as_str(),
            path = %payload.item_path(),
            "record enqueued"
        );
        Ok(record)
    }

    /// Every journal record, oldest first.
    pub async fn load_active(&self) -> Result<Vec<SyncRecord>, StoreError> {
        self.store.list_records(&self.partition_id).await
    }

    pub async fn update(&self, record: &SyncRecord) -> Result<(), StoreError> {
        self.store.update_record(record).await
    }

    /// Drops a finished record together with its issues.
    pub async fn remove(&self, record_id: RecordId) -> Result<(), StoreError> {
        self.store.delete_issues_for_record(record_id).await?;
        self.store.delete_record(record_id).await
    }

    /// Removes `record` unless a request of it is still out, in which case the
    /// cancel is only recorded.
    pub async fn cancel(&self, record: &mut SyncRecord) -> Result<CancelOutcome, StoreError> {
        if record.state.is_active() || !record.pending_request_ids().is_empty() {
            record.cancel_requested = true;
            self.store.update_record(record).await?;
            debug!(record_id = record.record_id, "cancel deferred until the request finishes");
            return Ok(CancelOutcome::Deferred);
        }
        self.remove(record.record_id).await?;
        debug!(record_id = record.record_id, "record cancelled");
        Ok(CancelOutcome::Removed)
    }
}
