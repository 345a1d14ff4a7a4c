use crate::{Result, TaskError, TaskValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a task invocation
pub type TaskId = Uuid;

/// Keyword arguments of an invocation
pub type Kwargs = BTreeMap<String, TaskValue>;

/// Positional and keyword arguments handed to a task handler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    #[serde(default)]
    pub args: Vec<TaskValue>,
    #[serde(default)]
    pub kwargs: Kwargs,
}

impl TaskArgs {
    pub fn new(args: Vec<TaskValue>, kwargs: Kwargs) -> Self {
        TaskArgs { args, kwargs }
    }

    pub fn positional(args: Vec<TaskValue>) -> Self {
        TaskArgs {
            args,
            kwargs: Kwargs::new(),
        }
    }

    /// Look up an argument by position, falling back to its keyword name.
    pub fn get(&self, position: usize, name: &str) -> Option<&TaskValue> {
        self.args.get(position).or_else(|| self.kwargs.get(name))
    }

    /// Like [`TaskArgs::get`] but requires a string.
    pub fn str(&self, position: usize, name: &str) -> std::result::Result<&str, String> {
        match self.get(position, name) {
            Some(TaskValue::Str(s)) => Ok(s),
            Some(other) => Err(format!("argument '{}' must be a string, got {}", name, other)),
            None => Err(format!("missing required argument '{}'", name)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.args.iter().try_for_each(TaskValue::validate)?;
        self.kwargs.values().try_for_each(TaskValue::validate)
    }
}

/// A single call of a registered task.
///
/// Immutable once published; the broker owns the encoded form from then on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
    /// Unique invocation identifier, also the result-store key
    pub id: TaskId,

    /// Registered task name
    pub task: String,

    #[serde(default)]
    pub args: Vec<TaskValue>,

    #[serde(default)]
    pub kwargs: Kwargs,

    /// Earliest time the task may run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,

    /// After this time the task is discarded instead of run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

impl TaskInvocation {
    /// Create an invocation with a fresh id
    pub fn new(task: impl Into<String>, arguments: TaskArgs) -> Self {
        TaskInvocation {
            id: Uuid::new_v4(),
            task: task.into(),
            args: arguments.args,
            kwargs: arguments.kwargs,
            eta: None,
            expires: None,
        }
    }

    pub fn builder(task: impl Into<String>) -> InvocationBuilder {
        InvocationBuilder::new(task)
    }

    pub fn arguments(&self) -> TaskArgs {
        TaskArgs {
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.map(|expires| expires <= now).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Builder for invocations with scheduling options
pub struct InvocationBuilder {
    task: String,
    args: Vec<TaskValue>,
    kwargs: Kwargs,
    eta: Option<DateTime<Utc>>,
    expires: Option<DateTime<Utc>>,
}

impl InvocationBuilder {
    pub fn new(task: impl Into<String>) -> Self {
        InvocationBuilder {
            task: task.into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
            eta: None,
            expires: None,
        }
    }

    pub fn arg(mut self, value: impl Into<TaskValue>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<TaskValue>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn arguments(mut self, arguments: TaskArgs) -> Self {
        self.args = arguments.args;
        self.kwargs = arguments.kwargs;
        self
    }

    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn build(self) -> Result<TaskInvocation> {
        if self.task.is_empty() {
            return Err(TaskError::UnknownTask(String::new()));
        }
        let arguments = TaskArgs::new(self.args, self.kwargs);
        arguments.validate()?;

        Ok(TaskInvocation {
            id: Uuid::new_v4(),
            task: self.task,
            args: arguments.args,
            kwargs: arguments.kwargs,
            eta: self.eta,
            expires: self.expires,
        })
    }
}
