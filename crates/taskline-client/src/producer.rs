use crate::handle::AsyncResult;
use crate::waiter::ResultWaiter;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use taskline_broker::Broker;
use taskline_core::{
    InvocationCodec, Result, Settings, TaskArgs, TaskError, TaskId, TaskInvocation, TaskRegistry,
};
use taskline_persistence::{ResultBackend, ResultStore};
use taskline_protocol::RetryConfig;
use taskline_worker::EagerRunner;
use tracing::{debug, info, instrument};

/// Scheduling options for one submission
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Earliest execution time
    pub eta: Option<DateTime<Utc>>,
    /// Delay from now; wins over `eta` when both are set
    pub countdown: Option<Duration>,
    /// Skip execution if not started by this time
    pub expires: Option<DateTime<Utc>>,
    /// Override the task's routed queue
    pub queue: Option<String>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    pub fn expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires = chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| Utc::now() + ttl);
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    fn resolved_eta(&self) -> Option<DateTime<Utc>> {
        match self.countdown {
            Some(countdown) => chrono::Duration::from_std(countdown)
                .ok()
                .map(|countdown| Utc::now() + countdown),
            None => self.eta,
        }
    }
}

/// Publishes invocations of registered tasks.
///
/// Shares the registry definition with the workers so unknown names are
/// rejected before anything reaches the broker. With `task_always_eager`
/// the task runs inline instead and the returned handle is already final.
pub struct Producer {
    settings: Settings,
    registry: Arc<TaskRegistry>,
    codec: InvocationCodec,
    broker: Arc<dyn Broker>,
    waiter: ResultWaiter,
    eager: Option<EagerRunner>,
}

impl Producer {
    pub fn new(
        settings: Settings,
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ResultStore>,
    ) -> Result<Self> {
        settings.validate()?;
        let codec = settings.codec()?;
        let backend = ResultBackend::new(store, settings.result_expires());
        let waiter = ResultWaiter::new(backend.clone(), settings.result_poll_interval());
        let eager = settings
            .task_always_eager
            .then(|| EagerRunner::new(registry.clone(), settings.clone(), Some(backend)));

        Ok(Producer {
            settings,
            registry,
            codec,
            broker,
            waiter,
            eager,
        })
    }

    /// Build a producer against the broker and result store named in the settings
    pub fn connect(settings: Settings, registry: Arc<TaskRegistry>) -> Result<Self> {
        let retry = RetryConfig {
            max_retries: settings.broker_connection_max_retries,
            base_delay: Duration::from_millis(settings.broker_connection_retry_delay_ms),
        };
        let broker =
            taskline_broker::connect(&settings.broker_url, settings.visibility_timeout(), retry)?;
        let store = taskline_persistence::connect(&settings.result_backend, retry)?;
        Self::new(settings, registry, broker, store)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn waiter(&self) -> &ResultWaiter {
        &self.waiter
    }

    pub fn is_eager(&self) -> bool {
        self.eager.is_some()
    }

    /// Submit with default options
    pub async fn delay(&self, name: &str, args: TaskArgs) -> Result<AsyncResult> {
        self.submit(name, args, SubmitOptions::default()).await
    }

    /// Publish one invocation of `name` and return its handle without
    /// waiting for execution.
    #[instrument(skip(self, args, options))]
    pub async fn submit(
        &self,
        name: &str,
        args: TaskArgs,
        options: SubmitOptions,
    ) -> Result<AsyncResult> {
        let definition = self.registry.lookup(name)?;

        let mut builder = TaskInvocation::builder(name).arguments(args);
        if let Some(eta) = options.resolved_eta() {
            builder = builder.eta(eta);
        }
        if let Some(expires) = options.expires {
            builder = builder.expires(expires);
        }
        let invocation = builder.build()?;

        if let Some(eager) = &self.eager {
            debug!("Running {} ({}) eagerly", name, invocation.id);
            let record = eager.run(&invocation).await?;
            return Ok(AsyncResult::eager(record, self.waiter.clone()));
        }

        let envelope = self.codec.encode(&invocation)?;
        let queue = options
            .queue
            .unwrap_or_else(|| self.settings.queue_for(&definition));

        self.broker
            .publish(&queue, envelope)
            .await
            .map_err(TaskError::from)?;

        info!("Submitted task {} ({}) to {}", name, invocation.id, queue);
        Ok(AsyncResult::new(invocation.id, self.waiter.clone()))
    }

    /// Handle for an id submitted elsewhere
    pub fn result(&self, id: TaskId) -> AsyncResult {
        AsyncResult::new(id, self.waiter.clone())
    }
}
