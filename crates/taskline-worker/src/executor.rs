use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use taskline_core::{
    HandlerError, TaskArgs, TaskContext, TaskDefinition, TaskId, TaskPolicy, TaskValue,
};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// How one attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(TaskValue),
    Failed(HandlerError),
    /// Terminated by the hard time limit
    TimeLimitExceeded(Duration),
    Panicked(String),
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub outcome: Outcome,
    pub elapsed: Duration,
}

impl Execution {
    /// The handler was cut off and may have left state behind in its unit
    pub fn was_terminated(&self) -> bool {
        matches!(self.outcome, Outcome::TimeLimitExceeded(_))
    }
}

/// Aborts the handler task when the owning unit goes away
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one attempt of a task under its time limits.
///
/// The handler runs in its own task: the soft limit cancels the context
/// token and lets the handler wind down, the hard limit aborts it. A
/// handler that panics is reported, not propagated.
pub async fn execute(
    definition: Arc<TaskDefinition>,
    policy: &TaskPolicy,
    id: TaskId,
    retries: u32,
    args: TaskArgs,
) -> Execution {
    let cancel = CancellationToken::new();
    let ctx = TaskContext::new(id, definition.name.clone(), retries, cancel.clone());
    let handler = definition.handler.clone();

    let start = Instant::now();
    let mut handle = AbortOnDrop(tokio::spawn(async move { handler.call(ctx, args).await }));

    let soft = sleep_until(policy.soft_time_limit.map(|d| start + d).unwrap_or(start));
    let hard = sleep_until(policy.hard_time_limit.map(|d| start + d).unwrap_or(start));
    tokio::pin!(soft, hard);
    let mut soft_armed = policy.soft_time_limit.is_some();
    let hard_armed = policy.hard_time_limit.is_some();

    let outcome = loop {
        tokio::select! {
            joined = &mut handle.0 => {
                break match joined {
                    Ok(Ok(value)) => Outcome::Success(value),
                    Ok(Err(e)) => Outcome::Failed(e),
                    Err(e) if e.is_panic() => {
                        let message = panic_message(e.into_panic());
                        error!("Task {} ({}) panicked: {}", definition.name, id, message);
                        Outcome::Panicked(message)
                    }
                    Err(_) => Outcome::Panicked("handler task was cancelled".to_string()),
                };
            }
            _ = &mut soft, if soft_armed => {
                soft_armed = false;
                warn!(
                    "Task {} ({}) exceeded soft time limit {:?}, requesting cancellation",
                    definition.name, id, policy.soft_time_limit.unwrap_or_default()
                );
                cancel.cancel();
            }
            _ = &mut hard, if hard_armed => {
                let limit = policy.hard_time_limit.unwrap_or_default();
                error!(
                    "Task {} ({}) exceeded hard time limit {:?}, terminating",
                    definition.name, id, limit
                );
                handle.0.abort();
                break Outcome::TimeLimitExceeded(limit);
            }
        }
    };

    Execution {
        outcome,
        elapsed: start.elapsed(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskline_core::{Settings, TaskOptions, TaskRegistry};
    use uuid::Uuid;

    fn definition(options: TaskOptions) -> (Arc<TaskDefinition>, TaskPolicy) {
        let mut registry = TaskRegistry::new();
        registry
            .register_fn("probe", options, |ctx, args| async move {
                match args.str(0, "mode")? {
                    "ok" => Ok(TaskValue::from("done")),
                    "fail" => Err(HandlerError::fatal("bad input")),
                    "panic" => panic!("boom"),
                    "sleep" => {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(TaskValue::Null)
                    }
                    "cooperative" => {
                        ctx.cancelled().await;
                        Err(HandlerError::SoftTimeLimitExceeded)
                    }
                    other => Err(HandlerError::fatal(format!("unknown mode {}", other))),
                }
            })
            .unwrap();
        let definition = registry.lookup("probe").unwrap();
        let settings = Settings {
            task_time_limit: None,
            ..Settings::default()
        };
        let policy = settings.policy_for(&definition);
        (definition, policy)
    }

    async fn run(options: TaskOptions, mode: &str) -> Execution {
        let (definition, policy) = definition(options);
        execute(
            definition,
            &policy,
            Uuid::new_v4(),
            0,
            TaskArgs::positional(vec![mode.into()]),
        )
        .await
    }

    #[tokio::test]
    async fn test_success_and_failure() {
        assert_eq!(
            run(TaskOptions::default(), "ok").await.outcome,
            Outcome::Success(TaskValue::from("done"))
        );
        assert_eq!(
            run(TaskOptions::default(), "fail").await.outcome,
            Outcome::Failed(HandlerError::fatal("bad input"))
        );
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let execution = run(TaskOptions::default(), "panic").await;
        assert_eq!(execution.outcome, Outcome::Panicked("boom".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_limit_terminates() {
        let execution = run(
            TaskOptions::new().hard_time_limit(Duration::from_secs(1)),
            "sleep",
        )
        .await;
        assert_eq!(
            execution.outcome,
            Outcome::TimeLimitExceeded(Duration::from_secs(1))
        );
        assert!(execution.was_terminated());
        assert!(execution.elapsed < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_limit_requests_cancellation() {
        let execution = run(
            TaskOptions::new()
                .soft_time_limit(Duration::from_secs(1))
                .hard_time_limit(Duration::from_secs(5)),
            "cooperative",
        )
        .await;
        assert_eq!(
            execution.outcome,
            Outcome::Failed(HandlerError::SoftTimeLimitExceeded)
        );
        assert!(!execution.was_terminated());
    }
}
