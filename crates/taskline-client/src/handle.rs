use crate::waiter::{into_value, ResultWaiter};
use std::fmt;
use std::time::Duration;
use taskline_core::{ExecutionRecord, Result, TaskId, TaskValue};

/// Caller-side reference to a submitted invocation
#[derive(Clone)]
pub struct AsyncResult {
    id: TaskId,
    waiter: ResultWaiter,
    /// Final record of an eagerly executed invocation
    eager: Option<ExecutionRecord>,
}

impl AsyncResult {
    pub fn new(id: TaskId, waiter: ResultWaiter) -> Self {
        AsyncResult {
            id,
            waiter,
            eager: None,
        }
    }

    pub(crate) fn eager(record: ExecutionRecord, waiter: ResultWaiter) -> Self {
        AsyncResult {
            id: record.id,
            waiter,
            eager: Some(record),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub async fn status(&self) -> Result<ExecutionRecord> {
        if let Some(record) = &self.eager {
            return Ok(record.clone());
        }
        self.waiter.status(&self.id).await
    }

    /// Whether the task has reached SUCCESS or FAILURE
    pub async fn ready(&self) -> Result<bool> {
        Ok(self.status().await?.is_terminal())
    }

    pub async fn wait(&self, timeout: Duration) -> Result<ExecutionRecord> {
        if let Some(record) = &self.eager {
            return Ok(record.clone());
        }
        self.waiter.wait(&self.id, timeout).await
    }

    pub async fn get(&self, timeout: Duration) -> Result<TaskValue> {
        into_value(self.wait(timeout).await?)
    }

    /// Drop the stored record; later reads see PENDING
    pub async fn forget(&self) -> Result<bool> {
        Ok(self.waiter.backend().forget(&self.id).await?)
    }
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("id", &self.id)
            .field("eager", &self.eager.is_some())
            .finish()
    }
}
