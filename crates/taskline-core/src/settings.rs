//! Shared settings for producers and workers.
//!
//! Loaded from an optional file layered under `TASKLINE_*` environment
//! variables; nested keys use `__` (`TASKLINE_TASK_ANNOTATIONS__ECHO__TIME_LIMIT`).

use crate::codec::InvocationCodec;
use crate::registry::TaskDefinition;
use crate::{Result, TaskError};
use chrono::{FixedOffset, Offset, Utc};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const ENV_PREFIX: &str = "TASKLINE";

/// Per-task overrides, in seconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskAnnotation {
    pub soft_time_limit: Option<f64>,
    pub time_limit: Option<f64>,
    pub default_retry_delay: Option<f64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub broker_url: String,
    pub result_backend: String,
    pub task_serializer: String,
    pub result_serializer: String,
    pub accept_content: Vec<String>,
    pub task_acks_late: bool,
    pub task_always_eager: bool,
    /// Hard limit in seconds applied to every task without its own
    pub task_time_limit: Option<f64>,
    pub task_soft_time_limit: Option<f64>,
    pub task_annotations: HashMap<String, TaskAnnotation>,
    pub task_reject_on_worker_lost: bool,
    pub task_track_started: bool,
    pub task_default_queue: String,
    pub task_default_max_retries: u32,
    pub task_default_retry_delay: f64,
    pub worker_concurrency: usize,
    pub worker_prefetch_multiplier: usize,
    /// `None` keeps execution units forever
    pub worker_max_tasks_per_child: Option<u32>,
    pub worker_max_redeliveries: u32,
    pub worker_lost_wait: f64,
    pub broker_visibility_timeout: f64,
    pub broker_connection_max_retries: u32,
    pub broker_connection_retry_delay_ms: u64,
    pub result_expires: u64,
    pub result_poll_interval_ms: u64,
    pub timezone: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            broker_url: "memory://".to_string(),
            result_backend: "memory://".to_string(),
            task_serializer: "json".to_string(),
            result_serializer: "json".to_string(),
            accept_content: vec!["json".to_string()],
            task_acks_late: true,
            task_always_eager: false,
            task_time_limit: Some(24.0 * 3600.0),
            task_soft_time_limit: None,
            task_annotations: HashMap::new(),
            task_reject_on_worker_lost: true,
            task_track_started: true,
            task_default_queue: "taskline".to_string(),
            task_default_max_retries: 3,
            task_default_retry_delay: 180.0,
            worker_concurrency: 4,
            worker_prefetch_multiplier: 1,
            worker_max_tasks_per_child: Some(20),
            worker_max_redeliveries: 3,
            worker_lost_wait: 59.0,
            broker_visibility_timeout: 3600.0,
            broker_connection_max_retries: 10,
            broker_connection_retry_delay_ms: 200,
            result_expires: 7200,
            result_poll_interval_ms: 100,
            timezone: "UTC".to_string(),
        }
    }
}

/// Limits and retry behaviour resolved for one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPolicy {
    pub soft_time_limit: Option<Duration>,
    pub hard_time_limit: Option<Duration>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_on_time_limit: bool,
}

impl Settings {
    /// Load from an optional file plus `TASKLINE_*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub fn load_with_prefix(path: Option<&str>, prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("accept_content"),
        );

        let settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TaskError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.task_acks_late {
            return Err(TaskError::Config(
                "task_acks_late=false is not supported, early acks lose work if a worker dies"
                    .to_string(),
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(TaskError::Config("worker_concurrency must be at least 1".to_string()));
        }
        if self.worker_prefetch_multiplier == 0 {
            return Err(TaskError::Config(
                "worker_prefetch_multiplier must be at least 1".to_string(),
            ));
        }
        if self.worker_max_tasks_per_child == Some(0) {
            return Err(TaskError::Config(
                "worker_max_tasks_per_child must be at least 1 when set".to_string(),
            ));
        }
        if self.result_serializer != "json" {
            return Err(TaskError::Config(format!(
                "unsupported result serializer: {}",
                self.result_serializer
            )));
        }
        self.codec()?;
        self.timezone()?;

        seconds("task_time_limit", self.task_time_limit)?;
        seconds("task_soft_time_limit", self.task_soft_time_limit)?;
        seconds("task_default_retry_delay", Some(self.task_default_retry_delay))?;
        seconds("worker_lost_wait", Some(self.worker_lost_wait))?;
        seconds("broker_visibility_timeout", Some(self.broker_visibility_timeout))?;
        for (name, annotation) in &self.task_annotations {
            seconds(&format!("{}.soft_time_limit", name), annotation.soft_time_limit)?;
            seconds(&format!("{}.time_limit", name), annotation.time_limit)?;
            seconds(&format!("{}.default_retry_delay", name), annotation.default_retry_delay)?;
        }
        Ok(())
    }

    pub fn codec(&self) -> Result<InvocationCodec> {
        InvocationCodec::new(&self.task_serializer, &self.accept_content)
    }

    /// `UTC`/`Z` or a fixed offset such as `+02:00`
    pub fn timezone(&self) -> Result<FixedOffset> {
        match self.timezone.as_str() {
            "UTC" | "utc" | "Z" => Ok(Utc.fix()),
            other => other
                .parse::<FixedOffset>()
                .map_err(|e| TaskError::Config(format!("invalid timezone {}: {}", other, e))),
        }
    }

    pub fn result_expires(&self) -> Duration {
        Duration::from_secs(self.result_expires)
    }

    pub fn result_poll_interval(&self) -> Duration {
        Duration::from_millis(self.result_poll_interval_ms.max(1))
    }

    pub fn visibility_timeout(&self) -> Duration {
        secs(self.broker_visibility_timeout).unwrap_or(Duration::from_secs(3600))
    }

    pub fn worker_lost_wait(&self) -> Duration {
        secs(self.worker_lost_wait).unwrap_or(Duration::from_secs(59))
    }

    /// Bounded number of unacknowledged deliveries a worker may hold
    pub fn prefetch_limit(&self) -> usize {
        self.worker_prefetch_multiplier.max(1) * self.worker_concurrency.max(1)
    }

    pub fn queue_for(&self, definition: &TaskDefinition) -> String {
        definition
            .options
            .queue
            .clone()
            .unwrap_or_else(|| self.task_default_queue.clone())
    }

    /// Resolve limits for a task: annotation first, then the task's own
    /// options, then the global defaults.
    pub fn policy_for(&self, definition: &TaskDefinition) -> TaskPolicy {
        let annotation = self.task_annotations.get(&definition.name);
        let options = &definition.options;

        let soft_time_limit = annotation
            .and_then(|a| a.soft_time_limit)
            .and_then(secs)
            .or(options.soft_time_limit)
            .or_else(|| self.task_soft_time_limit.and_then(secs));
        let hard_time_limit = annotation
            .and_then(|a| a.time_limit)
            .and_then(secs)
            .or(options.hard_time_limit)
            .or_else(|| self.task_time_limit.and_then(secs));
        let max_retries = annotation
            .and_then(|a| a.max_retries)
            .or(options.max_retries)
            .unwrap_or(self.task_default_max_retries);
        let retry_delay = annotation
            .and_then(|a| a.default_retry_delay)
            .and_then(secs)
            .or(options.default_retry_delay)
            .or_else(|| secs(self.task_default_retry_delay))
            .unwrap_or(Duration::from_secs(180));

        TaskPolicy {
            soft_time_limit,
            hard_time_limit,
            max_retries,
            retry_delay,
            retry_on_time_limit: options.retry_on_time_limit,
        }
    }
}

fn secs(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

fn seconds(name: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !(v.is_finite() && v >= 0.0) => Err(TaskError::Config(format!(
            "{} must be a non-negative number of seconds, got {}",
            name, v
        ))),
        _ => Ok(()),
    }
}
