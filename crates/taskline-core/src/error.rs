use crate::record::{TaskFailure, TaskState};
use crate::task::TaskId;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers of the registry, producer and result waiter.
///
/// Worker-side handler failures never appear here directly; they are stored in
/// the execution record and come back as [`TaskError::TaskFailed`] when a caller
/// asks for the result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("Task already registered: {0}")]
    DuplicateTask(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Content type {0} is not in the accepted content list")]
    ContentRejected(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Result store error: {0}")]
    ResultStore(String),

    #[error("Timed out after {waited:?} waiting for task {id} (last state {last_state})")]
    TaskTimeout {
        id: TaskId,
        waited: Duration,
        last_state: TaskState,
    },

    #[error("Task {id} failed: {failure}")]
    TaskFailed { id: TaskId, failure: TaskFailure },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
