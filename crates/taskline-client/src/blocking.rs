//! Thread-blocking facade for callers without an async runtime.
//!
//! Each call parks the calling thread for its full duration. Async callers
//! should await [`crate::AsyncResult`] instead so their own executor keeps
//! running while the task is pending.

use crate::{AsyncResult, Producer, SubmitOptions};
use std::sync::Arc;
use std::time::Duration;
use taskline_core::{
    ExecutionRecord, Result, Settings, TaskArgs, TaskError, TaskId, TaskRegistry, TaskValue,
};
use tokio::runtime::{Builder, Runtime};

pub struct BlockingProducer {
    runtime: Runtime,
    inner: Producer,
}

impl BlockingProducer {
    /// Wrap an existing producer; connections it holds must not be tied to
    /// another runtime's reactor.
    pub fn new(inner: Producer) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TaskError::Config(format!("failed to start runtime: {}", e)))?;
        Ok(BlockingProducer { runtime, inner })
    }

    pub fn connect(settings: Settings, registry: Arc<TaskRegistry>) -> Result<Self> {
        Self::new(Producer::connect(settings, registry)?)
    }

    pub fn producer(&self) -> &Producer {
        &self.inner
    }

    pub fn submit(
        &self,
        name: &str,
        args: TaskArgs,
        options: SubmitOptions,
    ) -> Result<AsyncResult> {
        self.runtime.block_on(self.inner.submit(name, args, options))
    }

    pub fn delay(&self, name: &str, args: TaskArgs) -> Result<AsyncResult> {
        self.submit(name, args, SubmitOptions::default())
    }

    pub fn status(&self, id: TaskId) -> Result<ExecutionRecord> {
        self.runtime.block_on(self.inner.result(id).status())
    }

    pub fn wait(&self, handle: &AsyncResult, timeout: Duration) -> Result<ExecutionRecord> {
        self.runtime.block_on(handle.wait(timeout))
    }

    pub fn get(&self, handle: &AsyncResult, timeout: Duration) -> Result<TaskValue> {
        self.runtime.block_on(handle.get(timeout))
    }

    /// Submit and wait in one call
    pub fn call(&self, name: &str, args: TaskArgs, timeout: Duration) -> Result<TaskValue> {
        let handle = self.delay(name, args)?;
        self.get(&handle, timeout)
    }
}
