use std::time::Duration;
use taskline_core::{ExecutionRecord, Result, TaskError, TaskId, TaskState, TaskValue};
use taskline_persistence::ResultBackend;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Polls the result store until a record turns terminal.
///
/// Giving up on a wait never touches the task itself: it keeps running on
/// its worker and its record can still turn terminal later.
#[derive(Clone)]
pub struct ResultWaiter {
    backend: ResultBackend,
    poll_interval: Duration,
}

impl ResultWaiter {
    pub fn new(backend: ResultBackend, poll_interval: Duration) -> Self {
        ResultWaiter {
            backend,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn backend(&self) -> &ResultBackend {
        &self.backend
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Current record, PENDING when the store has nothing for `id`
    pub async fn status(&self, id: &TaskId) -> Result<ExecutionRecord> {
        Ok(self.backend.status(id).await?)
    }

    /// Wait up to `timeout` for SUCCESS or FAILURE.
    ///
    /// The store is read once up front, so a zero timeout still observes a
    /// record that is already terminal.
    pub async fn wait(&self, id: &TaskId, timeout: Duration) -> Result<ExecutionRecord> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut ticks = interval_at(started + self.poll_interval, self.poll_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_state = TaskState::Pending;
        loop {
            let record = self.status(id).await?;
            if record.is_terminal() {
                return Ok(record);
            }
            if record.status != last_state {
                debug!("Task {} is {}", id, record.status);
                last_state = record.status;
            }

            if Instant::now() >= deadline {
                return Err(TaskError::TaskTimeout {
                    id: *id,
                    waited: started.elapsed(),
                    last_state,
                });
            }

            tokio::select! {
                _ = ticks.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Wait, then unwrap the result value or surface the stored failure
    pub async fn get(&self, id: &TaskId, timeout: Duration) -> Result<TaskValue> {
        let record = self.wait(id, timeout).await?;
        into_value(record)
    }
}

pub(crate) fn into_value(record: ExecutionRecord) -> Result<TaskValue> {
    match record.status {
        TaskState::Success => Ok(record.result),
        _ => {
            let failure = record.failure().ok_or_else(|| {
                TaskError::Serialization(format!("record for {} has no failure payload", record.id))
            })?;
            Err(TaskError::TaskFailed {
                id: record.id,
                failure,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use taskline_core::{ErrorKind, TaskFailure};
    use taskline_persistence::MemoryResultStore;
    use uuid::Uuid;

    fn waiter() -> ResultWaiter {
        let backend =
            ResultBackend::new(Arc::new(MemoryResultStore::new()), Duration::from_secs(60));
        ResultWaiter::new(backend, Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_on_unknown_id() {
        let waiter = waiter();
        let id = Uuid::new_v4();
        match waiter.wait(&id, Duration::ZERO).await {
            Err(TaskError::TaskTimeout { id: timed_out, last_state, .. }) => {
                assert_eq!(timed_out, id);
                assert_eq!(last_state, TaskState::Pending);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sees_record_written_later() {
        let waiter = waiter();
        let id = Uuid::new_v4();
        let backend = waiter.backend().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            backend
                .put(&ExecutionRecord::started(id, "echo", 0).succeed(TaskValue::from("ok")))
                .await
                .unwrap();
        });

        let started = Instant::now();
        let record = waiter.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, TaskState::Success);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_last_state() {
        let waiter = waiter();
        let id = Uuid::new_v4();
        waiter
            .backend()
            .put(&ExecutionRecord::started(id, "slow", 0))
            .await
            .unwrap();

        let started = Instant::now();
        let err = waiter.wait(&id, Duration::from_secs(1)).await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1100));
        assert!(matches!(
            err,
            TaskError::TaskTimeout { last_state: TaskState::Started, .. }
        ));
    }

    #[tokio::test]
    async fn test_get_surfaces_failure() {
        let waiter = waiter();
        let id = Uuid::new_v4();
        let failure = TaskFailure::new(ErrorKind::HandlerError, "boom");
        waiter
            .backend()
            .put(&ExecutionRecord::started(id, "bad", 0).fail(failure.clone(), None))
            .await
            .unwrap();

        assert_eq!(
            waiter.get(&id, Duration::ZERO).await,
            Err(TaskError::TaskFailed { id, failure })
        );
    }

    #[tokio::test]
    async fn test_wait_is_idempotent_on_terminal_records() {
        let waiter = waiter();
        let id = Uuid::new_v4();
        waiter
            .backend()
            .put(&ExecutionRecord::started(id, "echo", 0).succeed(TaskValue::Int(1)))
            .await
            .unwrap();

        let first = waiter.wait(&id, Duration::ZERO).await.unwrap();
        let second = waiter.wait(&id, Duration::ZERO).await.unwrap();
        assert_eq!(first, second);
    }
}
