use std::time::Duration;
use taskline_core::{Settings, TaskRegistry};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub settings: Settings,
    pub worker_id: String,
    /// Queues to consume; derived from the registry when `None`
    pub queues: Option<Vec<String>>,
    /// Longest single wait for a message before re-checking for shutdown
    pub poll_wait: Duration,
}

impl WorkerConfig {
    pub fn new(settings: Settings) -> Self {
        WorkerConfig {
            settings,
            worker_id: generate_worker_id(),
            queues: None,
            poll_wait: Duration::from_secs(1),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = Some(queues);
        self
    }

    /// The default queue plus every queue a registered task routes to
    pub fn queues_for(&self, registry: &TaskRegistry) -> Vec<String> {
        if let Some(queues) = &self.queues {
            return queues.clone();
        }

        let mut queues = vec![self.settings.task_default_queue.clone()];
        for name in registry.names() {
            if let Ok(definition) = registry.lookup(&name) {
                let queue = self.settings.queue_for(&definition);
                if !queues.contains(&queue) {
                    queues.push(queue);
                }
            }
        }
        queues
    }
}

/// `hostname-pid-random`
pub fn generate_worker_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let pid = std::process::id();
    let random = uuid::Uuid::new_v4().simple().to_string();

    format!("{}-{}-{}", hostname, pid, &random[..8])
}
