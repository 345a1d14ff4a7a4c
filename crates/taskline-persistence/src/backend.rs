use crate::{ResultStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use taskline_core::{ExecutionRecord, TaskId};
use tracing::debug;

pub const KEY_PREFIX: &str = "taskline-task-meta-";

/// Typed access to execution records on top of a [`ResultStore`].
///
/// Every write refreshes the record's expiry, so a record lives for
/// `expires` after its last transition whatever the state.
#[derive(Clone)]
pub struct ResultBackend {
    store: Arc<dyn ResultStore>,
    expires: Duration,
}

impl ResultBackend {
    pub fn new(store: Arc<dyn ResultStore>, expires: Duration) -> Self {
        ResultBackend { store, expires }
    }

    pub fn key(id: &TaskId) -> String {
        format!("{}{}", KEY_PREFIX, id)
    }

    pub fn expires(&self) -> Duration {
        self.expires
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// The stored record, or `None` if nothing was written yet (PENDING)
    pub async fn get(&self, id: &TaskId) -> crate::Result<Option<ExecutionRecord>> {
        let key = Self::key(id);
        match self.store.get(&key).await? {
            Some(bytes) => ExecutionRecord::from_json(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Current record, with absence reported as PENDING
    pub async fn status(&self, id: &TaskId) -> crate::Result<ExecutionRecord> {
        Ok(self
            .get(id)
            .await?
            .unwrap_or_else(|| ExecutionRecord::pending(*id)))
    }

    /// Last writer wins
    pub async fn put(&self, record: &ExecutionRecord) -> crate::Result<()> {
        let bytes = record.to_json().map_err(|e| StoreError::Corrupt {
            key: Self::key(&record.id),
            reason: e.to_string(),
        })?;
        debug!("Storing {} for task {}", record.status, record.id);
        self.store
            .set(&Self::key(&record.id), bytes, Some(self.expires))
            .await
    }

    pub async fn forget(&self, id: &TaskId) -> crate::Result<bool> {
        self.store.delete(&Self::key(id)).await
    }
}
