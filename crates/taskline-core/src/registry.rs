use crate::record::ErrorKind;
use crate::{Result, TaskArgs, TaskError, TaskId, TaskValue};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result type for task handlers
pub type HandlerResult = std::result::Result<TaskValue, HandlerError>;

/// Failure raised by a task handler.
///
/// The variant decides what the worker does next: `Retry` and `Transient`
/// are redelivered while retries remain, everything else is terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// Explicit retry request, optionally overriding the retry delay
    Retry {
        message: String,
        countdown: Option<Duration>,
    },
    /// A dependency hiccup worth another attempt
    Transient(String),
    /// Permanent failure
    Fatal(String),
    /// The handler noticed the soft time limit and gave up
    SoftTimeLimitExceeded,
}

impl HandlerError {
    pub fn retry(message: impl Into<String>) -> Self {
        HandlerError::Retry {
            message: message.into(),
            countdown: None,
        }
    }

    pub fn retry_in(message: impl Into<String>, countdown: Duration) -> Self {
        HandlerError::Retry {
            message: message.into(),
            countdown: Some(countdown),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        HandlerError::Fatal(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Retry { .. } => ErrorKind::RetryRequested,
            HandlerError::Transient(_) => ErrorKind::TransientError,
            HandlerError::Fatal(_) => ErrorKind::HandlerError,
            HandlerError::SoftTimeLimitExceeded => ErrorKind::SoftTimeLimitExceeded,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retry { .. } | HandlerError::Transient(_))
    }

    pub fn message(&self) -> String {
        match self {
            HandlerError::Retry { message, .. } => message.clone(),
            HandlerError::Transient(message) | HandlerError::Fatal(message) => message.clone(),
            HandlerError::SoftTimeLimitExceeded => "soft time limit exceeded".to_string(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Fatal(message)
    }
}

/// Per-attempt context handed to a handler
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub task: String,
    /// Retries performed before this attempt
    pub retries: u32,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        id: TaskId,
        task: impl Into<String>,
        retries: u32,
        cancel: CancellationToken,
    ) -> Self {
        TaskContext {
            id,
            task: task.into(),
            retries,
            cancel,
        }
    }

    /// True once the soft time limit has fired
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the soft time limit fires
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Bail out with `SoftTimeLimitExceeded` if cancellation was requested
    pub fn checkpoint(&self) -> std::result::Result<(), HandlerError> {
        if self.is_cancelled() {
            Err(HandlerError::SoftTimeLimitExceeded)
        } else {
            Ok(())
        }
    }
}

/// Trait for task handlers
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one attempt of the task
    async fn call(&self, ctx: TaskContext, args: TaskArgs) -> HandlerResult;
}

/// Adapter turning an async closure into a [`TaskHandler`]
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        FnHandler { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, TaskArgs) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn call(&self, ctx: TaskContext, args: TaskArgs) -> HandlerResult {
        (self.f)(ctx, args).await
    }
}

/// Execution options declared with a task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOptions {
    /// Cooperative cancellation deadline
    pub soft_time_limit: Option<Duration>,
    /// Forced termination deadline
    pub hard_time_limit: Option<Duration>,
    pub default_retry_delay: Option<Duration>,
    pub max_retries: Option<u32>,
    /// Queue to route to instead of the default queue
    pub queue: Option<String>,
    /// Treat a hard time limit as retryable
    pub retry_on_time_limit: bool,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn soft_time_limit(mut self, limit: Duration) -> Self {
        self.soft_time_limit = Some(limit);
        self
    }

    pub fn hard_time_limit(mut self, limit: Duration) -> Self {
        self.hard_time_limit = Some(limit);
        self
    }

    pub fn default_retry_delay(mut self, delay: Duration) -> Self {
        self.default_retry_delay = Some(delay);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn retry_on_time_limit(mut self, retry: bool) -> Self {
        self.retry_on_time_limit = retry;
        self
    }
}

/// A registered task: name, handler and options
pub struct TaskDefinition {
    pub name: String,
    pub handler: Arc<dyn TaskHandler>,
    pub options: TaskOptions,
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Task name to handler mapping.
///
/// Built once at startup through `&mut self`, then shared read-only behind an
/// `Arc` by producers and workers, so no locking is involved.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<TaskDefinition>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`; fails if the name is taken.
    pub fn register<H>(
        &mut self,
        name: impl Into<String>,
        handler: H,
        options: TaskOptions,
    ) -> Result<()>
    where
        H: TaskHandler + 'static,
    {
        self.register_arc(name, Arc::new(handler), options)
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(
        &mut self,
        name: impl Into<String>,
        options: TaskOptions,
        f: F,
    ) -> Result<()>
    where
        F: Fn(TaskContext, TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name, FnHandler::new(f), options)
    }

    pub fn register_arc(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        options: TaskOptions,
    ) -> Result<()> {
        let name = name.into();
        if self.tasks.contains_key(&name) {
            return Err(TaskError::DuplicateTask(name));
        }

        debug!("Registered task {}", name);
        self.tasks.insert(
            name.clone(),
            Arc::new(TaskDefinition {
                name,
                handler,
                options,
            }),
        );
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<TaskDefinition>> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::UnknownTask(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered task names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}
