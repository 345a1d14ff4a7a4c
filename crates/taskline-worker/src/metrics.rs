use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::time::Duration;
use taskline_core::TaskState;

/// Prometheus metrics for a worker pool
pub struct WorkerMetrics {
    pub registry: Registry,

    /// Attempts by resulting state and task name
    pub tasks_total: IntCounterVec,
    pub task_duration: HistogramVec,
    pub in_flight: IntGauge,
    /// Execution units replaced, by reason
    pub units_recycled: IntCounterVec,
}

impl WorkerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let tasks_total = IntCounterVec::new(
            Opts::new("taskline_worker_tasks_total", "Task attempts by resulting state and task"),
            &["state", "task"],
        )?;
        registry.register(Box::new(tasks_total.clone()))?;

        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "taskline_worker_task_duration_seconds",
                "Handler run time in seconds",
            ),
            &["task"],
        )?;
        registry.register(Box::new(task_duration.clone()))?;

        let in_flight = IntGauge::new("taskline_worker_in_flight", "Handlers currently running")?;
        registry.register(Box::new(in_flight.clone()))?;

        let units_recycled = IntCounterVec::new(
            Opts::new("taskline_worker_units_recycled_total", "Execution units replaced"),
            &["reason"],
        )?;
        registry.register(Box::new(units_recycled.clone()))?;

        Ok(WorkerMetrics {
            registry,
            tasks_total,
            task_duration,
            in_flight,
            units_recycled,
        })
    }

    pub fn record(&self, task: &str, state: TaskState, elapsed: Option<Duration>) {
        self.tasks_total
            .with_label_values(&[state.as_str(), task])
            .inc();
        if let Some(elapsed) = elapsed {
            self.task_duration
                .with_label_values(&[task])
                .observe(elapsed.as_secs_f64());
        }
    }

    pub fn tasks(&self, task: &str, state: TaskState) -> u64 {
        self.tasks_total
            .with_label_values(&[state.as_str(), task])
            .get()
    }

    pub fn recycled(&self, reason: &str) -> u64 {
        self.units_recycled.with_label_values(&[reason]).get()
    }

    pub fn encode(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;
        let mut buffer = Vec::new();
        prometheus::TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
