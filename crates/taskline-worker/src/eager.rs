use crate::executor;
use crate::retry::{decide, Disposition};
use std::sync::Arc;
use taskline_core::{ExecutionRecord, Result, Settings, TaskInvocation, TaskRegistry};
use taskline_persistence::ResultBackend;
use tracing::{debug, error};

/// Runs invocations in the caller's own task, bypassing the broker.
///
/// Time limits apply as on a worker; retries run back to back without
/// their delay. The final record is written to the backend when one is
/// configured so handles can read it like any other.
pub struct EagerRunner {
    registry: Arc<TaskRegistry>,
    settings: Settings,
    backend: Option<ResultBackend>,
}

impl EagerRunner {
    pub fn new(
        registry: Arc<TaskRegistry>,
        settings: Settings,
        backend: Option<ResultBackend>,
    ) -> Self {
        EagerRunner {
            registry,
            settings,
            backend,
        }
    }

    pub async fn run(&self, invocation: &TaskInvocation) -> Result<ExecutionRecord> {
        let definition = self.registry.lookup(&invocation.task)?;
        let policy = self.settings.policy_for(&definition);
        let mut retries = 0;

        let record = loop {
            let started = ExecutionRecord::started(invocation.id, &invocation.task, retries);
            let execution = executor::execute(
                definition.clone(),
                &policy,
                invocation.id,
                retries,
                invocation.arguments(),
            )
            .await;

            match decide(execution.outcome, &policy, retries) {
                Disposition::Succeeded(value) => break started.succeed(value),
                Disposition::Fail { failure, traceback } => break started.fail(failure, traceback),
                Disposition::Retry { failure, .. } => {
                    debug!(
                        "Eager task {} ({}) retrying inline: {}",
                        invocation.task, invocation.id, failure
                    );
                    retries += 1;
                }
            }
        };

        if let Some(backend) = &self.backend {
            if let Err(e) = backend.put(&record).await {
                error!("Failed to store eager result for {}: {}", invocation.id, e);
            }
        }
        Ok(record)
    }
}
