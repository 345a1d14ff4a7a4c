//! What to do after an attempt: finish, retry later, or fail for good.

use crate::executor::Outcome;
use std::time::Duration;
use taskline_core::{ErrorKind, HandlerError, TaskFailure, TaskPolicy, TaskValue};

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Succeeded(TaskValue),
    /// Record RETRY and redeliver after `delay`
    Retry { failure: TaskFailure, delay: Duration },
    /// Record FAILURE and acknowledge
    Fail {
        failure: TaskFailure,
        traceback: Option<String>,
    },
}

impl Disposition {
    pub fn is_retry(&self) -> bool {
        matches!(self, Disposition::Retry { .. })
    }
}

/// Decide the fate of an attempt that had `retries` retries before it.
///
/// Retryable failures are retried while `retries < max_retries`, so a task
/// that always fails transiently runs exactly `max_retries + 1` times.
pub fn decide(outcome: Outcome, policy: &TaskPolicy, retries: u32) -> Disposition {
    let (failure, retryable, countdown) = match outcome {
        Outcome::Success(value) => return Disposition::Succeeded(value),
        Outcome::Failed(err) => {
            let countdown = match &err {
                HandlerError::Retry { countdown, .. } => *countdown,
                _ => None,
            };
            (
                TaskFailure::new(err.kind(), err.message()),
                err.is_retryable(),
                countdown,
            )
        }
        Outcome::TimeLimitExceeded(limit) => (
            TaskFailure::new(
                ErrorKind::TimeLimitExceeded,
                format!("hard time limit ({:?}) exceeded", limit),
            ),
            policy.retry_on_time_limit,
            None,
        ),
        Outcome::Panicked(message) => {
            let failure = TaskFailure::new(ErrorKind::Panic, message.clone());
            return Disposition::Fail {
                failure,
                traceback: Some(format!("panicked at: {}", message)),
            };
        }
    };

    if retryable && retries < policy.max_retries {
        Disposition::Retry {
            failure,
            delay: countdown.unwrap_or(policy.retry_delay),
        }
    } else {
        let failure = if retryable {
            TaskFailure::new(
                failure.kind(),
                format!(
                    "{} (gave up after {} retries)",
                    failure.exc_message, policy.max_retries
                ),
            )
        } else {
            failure
        };
        Disposition::Fail {
            failure,
            traceback: None,
        }
    }
}
