use crate::config::WorkerConfig;
use crate::executor;
use crate::metrics::WorkerMetrics;
use crate::retry::{decide, Disposition};
use std::sync::Arc;
use taskline_broker::{Broker, BrokerError};
use taskline_core::codec::peek_id;
use taskline_core::{
    Delivery, DeliveryTag, ErrorKind, ExecutionRecord, InvocationCodec, Requeue, TaskError,
    TaskFailure, TaskId, TaskRegistry, TaskState,
};
use taskline_persistence::{ResultBackend, ResultStore};
use taskline_protocol::RetryConfig;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, instrument, warn};

/// A delivery handed to an execution unit, holding one prefetch slot
struct Job {
    delivery: Delivery,
    _permit: OwnedSemaphorePermit,
    _keep_alive: DropGuard,
}

type JobReceiver = Arc<Mutex<mpsc::Receiver<Job>>>;

const MIN_KEEP_ALIVE: std::time::Duration = std::time::Duration::from_millis(10);

/// Why an execution unit stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitExit {
    /// No more work will arrive
    Closed,
    /// Reached `worker_max_tasks_per_child`
    Recycled,
    /// A handler was terminated by its hard time limit
    Terminated,
}

/// Pool of execution units consuming from the broker.
///
/// Fetch loops pull at most `prefetch_multiplier x concurrency` unacknowledged
/// messages; each is settled only after its outcome is recorded.
pub struct Worker {
    config: WorkerConfig,
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn Broker>,
    backend: ResultBackend,
    codec: InvocationCodec,
    metrics: Arc<WorkerMetrics>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ResultStore>,
    ) -> Result<Self, TaskError> {
        config.settings.validate()?;
        let codec = config.settings.codec()?;
        let backend = ResultBackend::new(store, config.settings.result_expires());
        let metrics = WorkerMetrics::new().map_err(|e| TaskError::Config(e.to_string()))?;

        Ok(Worker {
            config,
            registry,
            broker,
            backend,
            codec,
            metrics: Arc::new(metrics),
            shutdown: CancellationToken::new(),
        })
    }

    /// Build a worker against the broker and result store named in the settings
    pub fn connect(config: WorkerConfig, registry: Arc<TaskRegistry>) -> Result<Self, TaskError> {
        let settings = &config.settings;
        let retry = RetryConfig {
            max_retries: settings.broker_connection_max_retries,
            base_delay: std::time::Duration::from_millis(settings.broker_connection_retry_delay_ms),
        };
        let broker =
            taskline_broker::connect(&settings.broker_url, settings.visibility_timeout(), retry)?;
        let store = taskline_persistence::connect(&settings.result_backend, retry)?;
        Self::new(config, registry, broker, store)
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        self.metrics.clone()
    }

    pub fn backend(&self) -> &ResultBackend {
        &self.backend
    }

    /// Stop fetching and drain in-flight work, up to `worker_lost_wait`
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown has been requested and in-flight work drained
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let settings = &self.config.settings;
        let concurrency = settings.worker_concurrency.max(1);
        let prefetch = settings.prefetch_limit();
        let queues = self.config.queues_for(&self.registry);

        info!(
            "Starting worker {} (concurrency: {}, prefetch: {}, queues: {:?}, tasks: {:?})",
            self.config.worker_id,
            concurrency,
            prefetch,
            queues,
            self.registry.names()
        );

        let (tx, rx) = mpsc::channel::<Job>(prefetch);
        let rx: JobReceiver = Arc::new(Mutex::new(rx));
        let permits = Arc::new(Semaphore::new(prefetch));

        let mut fetchers = JoinSet::new();
        for queue in queues {
            let worker = self.clone();
            let tx = tx.clone();
            let permits = permits.clone();
            fetchers.spawn(async move { worker.fetch_loop(queue, tx, permits).await });
        }
        drop(tx);

        let mut units = JoinSet::new();
        let mut next_unit = 0usize;
        for _ in 0..concurrency {
            next_unit += 1;
            units.spawn(self.clone().run_unit(next_unit, rx.clone()));
        }

        let drain_deadline = sleep_until(Instant::now());
        tokio::pin!(drain_deadline);
        let mut draining = false;

        loop {
            tokio::select! {
                joined = units.join_next() => {
                    let exit = match joined {
                        Some(Ok(exit)) => exit,
                        Some(Err(e)) => {
                            error!("Execution unit crashed: {}", e);
                            UnitExit::Terminated
                        }
                        None => break,
                    };
                    match exit {
                        UnitExit::Closed => {}
                        UnitExit::Recycled | UnitExit::Terminated => {
                            let reason = match exit {
                                UnitExit::Recycled => "max_tasks",
                                _ => "terminated",
                            };
                            self.metrics.units_recycled.with_label_values(&[reason]).inc();
                            next_unit += 1;
                            debug!("Replacing execution unit ({}) with unit {}", reason, next_unit);
                            units.spawn(self.clone().run_unit(next_unit, rx.clone()));
                        }
                    }
                }
                _ = self.shutdown.cancelled(), if !draining => {
                    draining = true;
                    let wait = settings.worker_lost_wait();
                    info!(
                        "Worker {} shutting down, draining in-flight tasks for up to {:?}",
                        self.config.worker_id, wait
                    );
                    drain_deadline.as_mut().reset(Instant::now() + wait);
                }
                _ = &mut drain_deadline, if draining => {
                    warn!(
                        "Drain deadline passed with {} units busy, their tasks will be redelivered",
                        units.len()
                    );
                    units.abort_all();
                    break;
                }
            }
        }

        fetchers.abort_all();
        info!("Worker {} stopped", self.config.worker_id);
        Ok(())
    }

    /// Pull messages from one queue while prefetch slots are free
    async fn fetch_loop(&self, queue: String, tx: mpsc::Sender<Job>, permits: Arc<Semaphore>) {
        let mut backoff = std::time::Duration::from_millis(100);
        loop {
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = self.shutdown.cancelled() => return,
            };

            let consumed = tokio::select! {
                consumed = self.broker.consume(&queue, self.config.poll_wait) => consumed,
                _ = self.shutdown.cancelled() => return,
            };

            match consumed {
                Ok(Some(delivery)) => {
                    backoff = std::time::Duration::from_millis(100);
                    debug!("Fetched {} from {}", delivery.tag, queue);
                    let job = Job {
                        _keep_alive: self.keep_alive(delivery.tag),
                        delivery,
                        _permit: permit,
                    };
                    if tx.send(job).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Consume from {} failed: {}; retrying in {:?}", queue, e, backoff);
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.cancelled() => return,
                    }
                    backoff = (backoff * 2).min(std::time::Duration::from_secs(10));
                }
            }
        }
    }

    /// Keep restarting the visibility timeout of a held delivery until the
    /// returned guard is dropped, so long-running work is not redelivered.
    fn keep_alive(&self, tag: DeliveryTag) -> DropGuard {
        let token = CancellationToken::new();
        let released = token.clone();
        let broker = self.broker.clone();
        let every = (self.config.settings.visibility_timeout() / 3).max(MIN_KEEP_ALIVE);

        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = released.cancelled() => return,
                    _ = ticks.tick() => {
                        if let Err(e) = broker.touch(tag).await {
                            warn!("Failed to extend visibility of {}: {}", tag, e);
                            if matches!(
                                e,
                                BrokerError::UnknownDelivery(_) | BrokerError::Rejected(_)
                            ) {
                                return;
                            }
                        }
                    }
                }
            }
        });
        token.drop_guard()
    }

    /// One execution unit: runs jobs one at a time until recycled or closed
    async fn run_unit(self: Arc<Self>, unit: usize, rx: JobReceiver) -> UnitExit {
        let max_tasks = self.config.settings.worker_max_tasks_per_child;
        let mut processed = 0u32;

        loop {
            let job = { rx.lock().await.recv().await };
            let Some(job) = job else {
                return UnitExit::Closed;
            };

            let terminated = self.process(&job.delivery).await;
            drop(job);
            processed += 1;

            if terminated {
                debug!("Unit {} retiring after a terminated task", unit);
                return UnitExit::Terminated;
            }
            if max_tasks.map(|max| processed >= max).unwrap_or(false) {
                debug!("Unit {} recycling after {} tasks", unit, processed);
                return UnitExit::Recycled;
            }
        }
    }

    /// Drive one delivery to a recorded outcome and settle it with the
    /// broker. Returns whether the handler had to be terminated.
    #[instrument(skip_all, fields(tag = %delivery.tag, queue = %delivery.queue))]
    async fn process(&self, delivery: &Delivery) -> bool {
        let settings = &self.config.settings;

        let invocation = match self.codec.decode(&delivery.envelope) {
            Ok(invocation) => invocation,
            Err(e) => {
                error!("Rejecting undecodable message {}: {}", delivery.tag, e);
                if let Some(id) = peek_id(&delivery.envelope.payload) {
                    let record = ExecutionRecord::pending(id)
                        .fail(TaskFailure::new(ErrorKind::DecodeError, e.to_string()), None)
                        .with_worker(&self.config.worker_id);
                    self.store(&record).await;
                }
                self.metrics.record("<undecodable>", TaskState::Failure, None);
                self.nack(delivery, Requeue::No).await;
                return false;
            }
        };

        let id = invocation.id;
        let name = invocation.task.clone();
        let retries = delivery.requeue_count;
        let base =
            ExecutionRecord::started(id, &name, retries).with_worker(&self.config.worker_id);

        if delivery.is_redelivered() && self.already_settled(&name, id).await {
            self.ack(delivery).await;
            return false;
        }

        if invocation.is_expired() {
            warn!("Task {} ({}) expired before it could run", name, id);
            let failure = TaskFailure::new(ErrorKind::Expired, "task expired before execution");
            self.finish(delivery, &name, base.fail(failure, None), None).await;
            return false;
        }

        let definition = match self.registry.lookup(&name) {
            Ok(definition) => definition,
            Err(e) => {
                error!("Received unregistered task {} ({})", name, id);
                let failure = TaskFailure::new(ErrorKind::UnknownTask, e.to_string());
                self.finish(delivery, &name, base.fail(failure, None), None).await;
                return false;
            }
        };

        let lost = delivery.lost_count();
        if lost > 0 {
            if !settings.task_reject_on_worker_lost {
                error!("Task {} ({}) was running on a worker that was lost", name, id);
                let failure = TaskFailure::new(
                    ErrorKind::WorkerLost,
                    "worker exited before acknowledging the task",
                );
                self.finish(delivery, &name, base.fail(failure, None), None).await;
                return false;
            }
            if lost > settings.worker_max_redeliveries {
                error!(
                    "Task {} ({}) lost its worker {} times, giving up",
                    name, id, lost
                );
                let failure = TaskFailure::new(
                    ErrorKind::WorkerLost,
                    format!("worker lost {} times while executing the task", lost),
                );
                self.finish(delivery, &name, base.fail(failure, None), None).await;
                return false;
            }
            warn!(
                "Re-running task {} ({}) after worker loss ({} of {})",
                name, id, lost, settings.worker_max_redeliveries
            );
        }

        let policy = settings.policy_for(&definition);
        if settings.task_track_started {
            self.store(&base).await;
        }

        info!("Executing task {} ({}), retries: {}", name, id, retries);
        self.metrics.in_flight.inc();
        let execution =
            executor::execute(definition, &policy, id, retries, invocation.arguments()).await;
        self.metrics.in_flight.dec();
        let terminated = execution.was_terminated();

        match decide(execution.outcome, &policy, retries) {
            Disposition::Succeeded(value) => {
                info!("Task {} ({}) succeeded in {:?}", name, id, execution.elapsed);
                self.finish(delivery, &name, base.succeed(value), Some(execution.elapsed))
                    .await;
            }
            Disposition::Fail { failure, traceback } => {
                error!("Task {} ({}) failed: {}", name, id, failure);
                self.finish(delivery, &name, base.fail(failure, traceback), Some(execution.elapsed))
                    .await;
            }
            Disposition::Retry { failure, delay } => {
                warn!(
                    "Task {} ({}) failed: {}; retry {}/{} in {:?}",
                    name,
                    id,
                    failure,
                    retries + 1,
                    policy.max_retries,
                    delay
                );
                let record = base.retry(failure);
                self.store(&record).await;
                self.metrics.record(&name, TaskState::Retry, Some(execution.elapsed));
                self.nack(delivery, Requeue::after(delay)).await;
            }
        }

        terminated
    }

    /// A redelivered message whose outcome was recorded before its ack got
    /// through; running it again would move a terminal record backwards.
    async fn already_settled(&self, name: &str, id: TaskId) -> bool {
        match self.backend.get(&id).await {
            Ok(Some(current)) if !current.status.can_transition_to(TaskState::Started) => {
                warn!(
                    "Task {} ({}) was redelivered after reaching {}, not running it again",
                    name, id, current.status
                );
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("Could not read the record for {} before re-running: {}", id, e);
                false
            }
        }
    }

    /// Record a terminal state, then acknowledge
    async fn finish(
        &self,
        delivery: &Delivery,
        task: &str,
        record: ExecutionRecord,
        elapsed: Option<std::time::Duration>,
    ) {
        self.store(&record).await;
        self.metrics.record(task, record.status, elapsed);
        self.ack(delivery).await;
    }

    // A failed write is logged and the message is settled anyway.
    async fn store(&self, record: &ExecutionRecord) {
        if let Err(e) = self.backend.put(record).await {
            error!("Failed to store {} record for {}: {}", record.status, record.id, e);
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(delivery.tag).await {
            warn!("Failed to ack {}: {}", delivery.tag, e);
        }
    }

    async fn nack(&self, delivery: &Delivery, requeue: Requeue) {
        if let Err(e) = self.broker.nack(delivery.tag, requeue).await {
            warn!("Failed to nack {}: {}", delivery.tag, e);
        }
    }
}
