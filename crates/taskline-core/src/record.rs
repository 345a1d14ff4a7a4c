use crate::{TaskId, TaskValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an invocation as seen in the result store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    /// No record yet: queued, or unknown id
    Pending,
    /// A worker picked the task up and is running the handler
    Started,
    /// The last attempt failed and a redelivery is scheduled
    Retry,
    /// Finished with a return value
    Success,
    /// Finished with an error
    Failure,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Retry => "RETRY",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }

    /// Monotonic ordering, except RETRY -> STARTED which repeats per attempt.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Pending, _) => true,
            (Started, Retry | Success | Failure | Started) => true,
            (Retry, Started | Retry | Failure) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The handler returned a non-retryable error
    HandlerError,
    /// The handler returned a transient error
    TransientError,
    /// The handler asked to be retried
    RetryRequested,
    /// The hard time limit terminated the handler
    TimeLimitExceeded,
    /// The handler stopped after the soft time limit asked it to
    SoftTimeLimitExceeded,
    /// The handler panicked
    Panic,
    /// The message could not be decoded
    DecodeError,
    /// The worker has no handler for the task name
    UnknownTask,
    /// The invocation expired before it ran
    Expired,
    /// The message was redelivered after a worker disappeared
    WorkerLost,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::HandlerError => "HandlerError",
            ErrorKind::TransientError => "TransientError",
            ErrorKind::RetryRequested => "RetryRequested",
            ErrorKind::TimeLimitExceeded => "TimeLimitExceeded",
            ErrorKind::SoftTimeLimitExceeded => "SoftTimeLimitExceeded",
            ErrorKind::Panic => "Panic",
            ErrorKind::DecodeError => "DecodeError",
            ErrorKind::UnknownTask => "UnknownTask",
            ErrorKind::Expired => "Expired",
            ErrorKind::WorkerLost => "WorkerLost",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload stored as the record result for RETRY and FAILURE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub exc_type: ErrorKind,
    pub exc_message: String,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        TaskFailure {
            exc_type: kind,
            exc_message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.exc_type
    }

    pub fn to_value(&self) -> TaskValue {
        let mut map = std::collections::BTreeMap::new();
        map.insert("exc_type".to_string(), TaskValue::from(self.exc_type.as_str()));
        map.insert("exc_message".to_string(), TaskValue::from(self.exc_message.clone()));
        TaskValue::Map(map)
    }

    pub fn from_value(value: &TaskValue) -> Option<Self> {
        value.deserialize_into().ok()
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exc_type, self.exc_message)
    }
}

/// State and outcome of one invocation, keyed by its id in the result store.
///
/// Wire form: `{id, status, result, traceback?, ...}`. On SUCCESS `result`
/// holds the return value; on RETRY/FAILURE it holds a [`TaskFailure`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: TaskId,

    pub status: TaskState,

    #[serde(default)]
    pub result: TaskValue,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,

    /// Task name, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    /// Number of retries performed before the current attempt
    #[serde(default)]
    pub retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Worker that wrote the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl ExecutionRecord {
    /// Placeholder for an id with nothing in the store yet
    pub fn pending(id: TaskId) -> Self {
        ExecutionRecord {
            id,
            status: TaskState::Pending,
            result: TaskValue::Null,
            traceback: None,
            task: None,
            retries: 0,
            started_at: None,
            finished_at: None,
            worker: None,
        }
    }

    pub fn started(id: TaskId, task: impl Into<String>, retries: u32) -> Self {
        ExecutionRecord {
            status: TaskState::Started,
            task: Some(task.into()),
            retries,
            started_at: Some(Utc::now()),
            ..Self::pending(id)
        }
    }

    pub fn succeed(mut self, value: TaskValue) -> Self {
        self.status = TaskState::Success;
        self.result = value;
        self.traceback = None;
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn fail(mut self, failure: TaskFailure, traceback: Option<String>) -> Self {
        self.status = TaskState::Failure;
        self.result = failure.to_value();
        self.traceback = traceback;
        self.finished_at = Some(Utc::now());
        self
    }

    /// Record a failed attempt that will be redelivered
    pub fn retry(mut self, failure: TaskFailure) -> Self {
        self.status = TaskState::Retry;
        self.result = failure.to_value();
        self.retries += 1;
        self.finished_at = None;
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The error payload, for RETRY and FAILURE records
    pub fn failure(&self) -> Option<TaskFailure> {
        match self.status {
            TaskState::Retry | TaskState::Failure => TaskFailure::from_value(&self.result),
            _ => None,
        }
    }

    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(crate::TaskError::from)
    }

    pub fn from_json(bytes: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(bytes).map_err(crate::TaskError::from)
    }
}
