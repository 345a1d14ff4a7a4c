use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskline_broker::{Broker, MemoryBroker};
use taskline_core::{
    Envelope, ErrorKind, ExecutionRecord, HandlerError, InvocationCodec, Settings, TaskArgs,
    TaskId, TaskInvocation, TaskOptions, TaskRegistry, TaskState, TaskValue,
};
use taskline_persistence::{MemoryResultStore, ResultBackend};
use taskline_worker::{register_builtin_tasks, Worker, WorkerConfig};
use tokio::task::JoinHandle;

const QUEUE: &str = "taskline";

fn settings() -> Settings {
    Settings {
        task_default_retry_delay: 1.0,
        worker_lost_wait: 5.0,
        broker_visibility_timeout: 2.0,
        ..Settings::default()
    }
}

fn registry_with<F>(register: F) -> Arc<TaskRegistry>
where
    F: FnOnce(&mut TaskRegistry),
{
    let mut registry = TaskRegistry::new();
    register_builtin_tasks(&mut registry).unwrap();
    register(&mut registry);
    Arc::new(registry)
}

struct Harness {
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryResultStore>,
    backend: ResultBackend,
    codec: InvocationCodec,
}

impl Harness {
    fn new(settings: &Settings) -> Self {
        let store = Arc::new(MemoryResultStore::new());
        Harness {
            broker: Arc::new(MemoryBroker::new(settings.visibility_timeout())),
            backend: ResultBackend::new(store.clone(), settings.result_expires()),
            store,
            codec: InvocationCodec::default(),
        }
    }

    fn worker(&self, settings: Settings, registry: Arc<TaskRegistry>) -> Arc<Worker> {
        let config = WorkerConfig::new(settings).with_worker_id("test-worker");
        Arc::new(Worker::new(config, registry, self.broker.clone(), self.store.clone()).unwrap())
    }

    fn start(&self, worker: &Arc<Worker>) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(worker.clone().run())
    }

    async fn publish(&self, invocation: &TaskInvocation) {
        let envelope = self.codec.encode(invocation).unwrap();
        self.broker.publish(QUEUE, envelope).await.unwrap();
    }

    async fn send(&self, task: &str, args: Vec<TaskValue>) -> TaskId {
        let invocation = TaskInvocation::new(task, TaskArgs::positional(args));
        self.publish(&invocation).await;
        invocation.id
    }

    async fn wait_for(&self, id: TaskId, state: TaskState) -> ExecutionRecord {
        for _ in 0..10_000 {
            if let Ok(Some(record)) = self.backend.get(&id).await {
                if record.status == state {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached {}", id, state);
    }

    async fn wait_settled(&self) {
        for _ in 0..10_000 {
            if self.broker.unacked_len() == 0 && self.broker.queue_len(QUEUE) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("broker never drained");
    }
}

#[tokio::test(start_paused = true)]
async fn test_echo_round_trip() {
    let settings = settings();
    let harness = Harness::new(&settings);
    let worker = harness.worker(settings, registry_with(|_| {}));
    let handle = harness.start(&worker);

    let id = harness.send("echo", vec!["hi".into()]).await;
    let record = harness.wait_for(id, TaskState::Success).await;
    assert_eq!(record.result, TaskValue::from("Echo: hi"));
    assert_eq!(record.task.as_deref(), Some("echo"));
    assert_eq!(record.worker.as_deref(), Some("test-worker"));
    assert_eq!(record.retries, 0);

    harness.wait_settled().await;
    assert!(harness.broker.dead_letters().is_empty());
    assert_eq!(worker.metrics().tasks("echo", TaskState::Success), 1);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_bounded() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let registry = registry_with(move |registry| {
        registry
            .register_fn("flaky", TaskOptions::new().max_retries(2), move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::transient("upstream down"))
                }
            })
            .unwrap();
    });

    let settings = settings();
    let harness = Harness::new(&settings);
    let worker = harness.worker(settings, registry);
    let handle = harness.start(&worker);

    let id = harness.send("flaky", vec![]).await;
    let record = harness.wait_for(id, TaskState::Failure).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(record.retries, 2);
    let failure = record.failure().unwrap();
    assert_eq!(failure.kind(), ErrorKind::TransientError);
    assert!(failure.exc_message.contains("gave up after 2 retries"));

    harness.wait_settled().await;
    assert_eq!(worker.metrics().tasks("flaky", TaskState::Retry), 2);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_succeed() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let registry = registry_with(move |registry| {
        registry
            .register_fn("eventually", TaskOptions::default(), move |ctx, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if ctx.retries < 2 {
                        Err(HandlerError::retry_in("not yet", Duration::from_millis(50)))
                    } else {
                        Ok(TaskValue::Int(ctx.retries as i64))
                    }
                }
            })
            .unwrap();
    });

    let settings = settings();
    let harness = Harness::new(&settings);
    let worker = harness.worker(settings, registry);
    let handle = harness.start(&worker);

    let id = harness.send("eventually", vec![]).await;
    let record = harness.wait_for(id, TaskState::Success).await;
    assert_eq!(record.result, TaskValue::Int(2));
    assert_eq!(record.retries, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_hard_time_limit_terminates_and_replaces_unit() {
    let registry = registry_with(|registry| {
        registry
            .register_fn(
                "stuck",
                TaskOptions::new().hard_time_limit(Duration::from_secs(1)),
                |_, _| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(TaskValue::Null)
                },
            )
            .unwrap();
    });

    let settings = Settings {
        worker_concurrency: 1,
        ..settings()
    };
    let harness = Harness::new(&settings);
    let worker = harness.worker(settings, registry);
    let handle = harness.start(&worker);

    let id = harness.send("stuck", vec![]).await;
    let record = harness.wait_for(id, TaskState::Failure).await;
    assert_eq!(record.failure().unwrap().kind(), ErrorKind::TimeLimitExceeded);

    // The replacement unit keeps serving.
    let next = harness.send("echo", vec!["after".into()]).await;
    harness.wait_for(next, TaskState::Success).await;
    assert_eq!(worker.metrics().recycled("terminated"), 1);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_soft_time_limit_is_catchable() {
    let registry = registry_with(|registry| {
        registry
            .register_fn(
                "cooperative",
                TaskOptions::new()
                    .soft_time_limit(Duration::from_secs(1))
                    .hard_time_limit(Duration::from_secs(10)),
                |ctx, _| async move {
                    ctx.cancelled().await;
                    ctx.checkpoint()?;
                    Ok(TaskValue::Null)
                },
            )
            .unwrap();
    });

    let settings = settings();
    let harness = Harness::new(&settings);
    let worker = harness.worker(settings, registry);
    let handle = harness.start(&worker);

    let id = harness.send("cooperative", vec![]).await;
    let record = harness.wait_for(id, TaskState::Failure).await;
    assert_eq!(
        record.failure().unwrap().kind(),
        ErrorKind::SoftTimeLimitExceeded
    );
    assert_eq!(worker.metrics().recycled("terminated"), 0);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_message_is_dead_lettered() {
    let settings = settings();
    let harness = Harness::new(&settings);
    let worker = harness.worker(settings, registry_with(|_| {}));
    let handle = harness.start(&worker);

    let id = uuid::Uuid::new_v4();
    let payload = format!(r#"{{"id": "{}", "task": 42}}"#, id);
    harness
        .broker
        .publish(QUEUE, Envelope::json(payload.into_bytes()))
        .await
        .unwrap();

    let record = harness.wait_for(id, TaskState::Failure).await;
    assert_eq!(record.failure().unwrap().kind(), ErrorKind::DecodeError);

    harness.wait_settled().await;
    assert_eq!(harness.broker.dead_letters().len(), 1);

    // The pool carries on after the poison message.
    let next = harness.send("echo", vec!["still here".into()]).await;
    harness.wait_for(next, TaskState::Success).await;

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unknown_task_fails_without_redelivery() {
    let settings = settings();
    let harness = Harness::new(&settings);
    let worker = harness.worker(settings, registry_with(|_| {}));
    let handle = harness.start(&worker);

    let id = harness.send("no_such_task", vec![]).await;
    let record = harness.wait_for(id, TaskState::Failure).await;
    assert_eq!(record.failure().unwrap().kind(), ErrorKind::UnknownTask);

    harness.wait_settled().await;
    assert!(harness.broker.dead_letters().is_empty());

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_expired_task_is_not_run() {
    let settings = settings();
    let harness = Harness::new(&settings);
    let worker = harness.worker(settings, registry_with(|_| {}));
    let handle = harness.start(&worker);

    let mut invocation = TaskInvocation::new("echo", TaskArgs::positional(vec!["late".into()]));
    invocation.expires = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
    harness.publish(&invocation).await;

    let record = harness.wait_for(invocation.id, TaskState::Failure).await;
    assert_eq!(record.failure().unwrap().kind(), ErrorKind::Expired);
    assert_eq!(worker.metrics().tasks("echo", TaskState::Success), 0);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

fn blocking_first_attempt(attempts: Arc<AtomicU32>) -> Arc<TaskRegistry> {
    registry_with(move |registry| {
        registry
            .register_fn("fragile", TaskOptions::default(), move |_, _| {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                    Ok(TaskValue::from("done"))
                }
            })
            .unwrap();
    })
}

#[tokio::test(start_paused = true)]
async fn test_crashed_worker_task_is_redelivered() {
    let attempts = Arc::new(AtomicU32::new(0));
    let settings = settings();
    let harness = Harness::new(&settings);

    let first = harness.worker(settings.clone(), blocking_first_attempt(attempts.clone()));
    let crashed = harness.start(&first);
    let id = harness.send("fragile", vec![]).await;
    harness.wait_for(id, TaskState::Started).await;

    crashed.abort();
    let _ = crashed.await;
    assert_eq!(harness.broker.unacked_len(), 1);

    let second = harness.worker(settings, blocking_first_attempt(attempts.clone()));
    let handle = harness.start(&second);

    let record = harness.wait_for(id, TaskState::Success).await;
    assert_eq!(record.result, TaskValue::from("done"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    harness.wait_settled().await;

    second.shutdown();
    handle.await.unwrap().unwrap();
}

/// Check the message out without settling it, as a consumer that dies would
async fn lose_delivery(harness: &Harness, settings: &Settings) {
    let delivery = harness
        .broker
        .consume(QUEUE, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(delivery.is_some());
    tokio::time::sleep(settings.visibility_timeout() + Duration::from_millis(100)).await;
}

#[tokio::test(start_paused = true)]
async fn test_worker_lost_is_failure_without_reject() {
    let settings = Settings {
        task_reject_on_worker_lost: false,
        ..settings()
    };
    let harness = Harness::new(&settings);
    let id = harness.send("echo", vec!["x".into()]).await;
    lose_delivery(&harness, &settings).await;

    let worker = harness.worker(settings, registry_with(|_| {}));
    let handle = harness.start(&worker);

    let record = harness.wait_for(id, TaskState::Failure).await;
    assert_eq!(record.failure().unwrap().kind(), ErrorKind::WorkerLost);
    harness.wait_settled().await;

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_redeliveries_after_worker_loss_are_bounded() {
    let settings = Settings {
        worker_max_redeliveries: 1,
        ..settings()
    };
    let harness = Harness::new(&settings);
    let id = harness.send("echo", vec!["x".into()]).await;
    lose_delivery(&harness, &settings).await;
    lose_delivery(&harness, &settings).await;

    let worker = harness.worker(settings, registry_with(|_| {}));
    let handle = harness.start(&worker);

    let record = harness.wait_for(id, TaskState::Failure).await;
    let failure = record.failure().unwrap();
    assert_eq!(failure.kind(), ErrorKind::WorkerLost);
    assert!(failure.exc_message.contains("2 times"));
    assert_eq!(worker.metrics().tasks("echo", TaskState::Success), 0);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_single_loss_is_rerun() {
    let settings = settings();
    let harness = Harness::new(&settings);
    let id = harness.send("echo", vec!["again".into()]).await;
    lose_delivery(&harness, &settings).await;

    let worker = harness.worker(settings, registry_with(|_| {}));
    let handle = harness.start(&worker);

    let record = harness.wait_for(id, TaskState::Success).await;
    assert_eq!(record.result, TaskValue::from("Echo: again"));

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_after_recorded_outcome_is_not_rerun() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let registry = registry_with(move |registry| {
        registry
            .register_fn("counted", TaskOptions::default(), move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(TaskValue::from("second run"))
                }
            })
            .unwrap();
    });

    let settings = settings();
    let harness = Harness::new(&settings);
    let id = harness.send("counted", vec![]).await;

    // The first consumer recorded its result, then died before acking.
    let recorded =
        ExecutionRecord::started(id, "counted", 0).succeed(TaskValue::from("first run"));
    harness.backend.put(&recorded).await.unwrap();
    lose_delivery(&harness, &settings).await;

    let worker = harness.worker(settings, registry);
    let handle = harness.start(&worker);
    harness.wait_settled().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 0);
    let record = harness.backend.status(&id).await.unwrap();
    assert_eq!(record.status, TaskState::Success);
    assert_eq!(record.result, TaskValue::from("first run"));
    assert!(harness.broker.dead_letters().is_empty());

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_units_recycle_after_max_tasks() {
    let settings = Settings {
        worker_concurrency: 1,
        worker_max_tasks_per_child: Some(2),
        ..settings()
    };
    let harness = Harness::new(&settings);
    let worker = harness.worker(settings, registry_with(|_| {}));
    let handle = harness.start(&worker);

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(harness.send("echo", vec![TaskValue::from(format!("m{}", i))]).await);
    }
    for id in ids {
        harness.wait_for(id, TaskState::Success).await;
    }
    harness.wait_settled().await;
    assert!(worker.metrics().recycled("max_tasks") >= 2);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

fn slow_task(duration: Duration) -> Arc<TaskRegistry> {
    registry_with(move |registry| {
        registry
            .register_fn("slow", TaskOptions::default(), move |_, _| async move {
                tokio::time::sleep(duration).await;
                Ok(TaskValue::from("finished"))
            })
            .unwrap();
    })
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_in_flight_tasks() {
    let settings = settings();
    let harness = Harness::new(&settings);
    let worker = harness.worker(settings, slow_task(Duration::from_secs(2)));
    let handle = harness.start(&worker);

    let id = harness.send("slow", vec![]).await;
    harness.wait_for(id, TaskState::Started).await;

    worker.shutdown();
    handle.await.unwrap().unwrap();

    let record = harness.backend.status(&id).await.unwrap();
    assert_eq!(record.status, TaskState::Success);
    assert_eq!(harness.broker.unacked_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_task_outliving_visibility_timeout_runs_once() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let registry = registry_with(move |registry| {
        registry
            .register_fn("long", TaskOptions::default(), move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(7)).await;
                    Ok(TaskValue::from("finished"))
                }
            })
            .unwrap();
    });

    let settings = Settings {
        worker_concurrency: 2,
        ..settings()
    };
    let harness = Harness::new(&settings);
    let worker = harness.worker(settings, registry);
    let handle = harness.start(&worker);

    let id = harness.send("long", vec![]).await;
    let record = harness.wait_for(id, TaskState::Success).await;
    assert_eq!(record.retries, 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(harness.broker.stats().redelivered, 0);
    harness.wait_settled().await;
    assert_eq!(worker.metrics().tasks("long", TaskState::Success), 1);
    assert_eq!(worker.metrics().tasks("long", TaskState::Failure), 0);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_deadline_leaves_task_for_redelivery() {
    let settings = Settings {
        worker_lost_wait: 1.0,
        ..settings()
    };
    let harness = Harness::new(&settings);
    let worker = harness.worker(settings, slow_task(Duration::from_secs(3600)));
    let handle = harness.start(&worker);

    let id = harness.send("slow", vec![]).await;
    harness.wait_for(id, TaskState::Started).await;

    worker.shutdown();
    handle.await.unwrap().unwrap();

    let record = harness.backend.status(&id).await.unwrap();
    assert_eq!(record.status, TaskState::Started);
    assert_eq!(harness.broker.unacked_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_still_acknowledges() {
    let settings = settings();
    let harness = Harness::new(&settings);
    let worker = harness.worker(settings, registry_with(|_| {}));
    let handle = harness.start(&worker);

    harness.store.set_available(false);
    let id = harness.send("echo", vec!["lost result".into()]).await;
    harness.wait_settled().await;
    assert!(harness.broker.dead_letters().is_empty());

    harness.store.set_available(true);
    let record = harness.backend.status(&id).await.unwrap();
    assert_eq!(record.status, TaskState::Pending);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_and_prefetch_are_bounded() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (running.clone(), peak.clone());
    let registry = registry_with(move |registry| {
        registry
            .register_fn("busy", TaskOptions::default(), move |_, _| {
                let (running, peak) = (r.clone(), p.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(TaskValue::Null)
                }
            })
            .unwrap();
    });

    let settings = Settings {
        worker_concurrency: 2,
        worker_prefetch_multiplier: 1,
        ..settings()
    };
    let harness = Harness::new(&settings);
    let worker = harness.worker(settings, registry);
    let handle = harness.start(&worker);

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(harness.send("busy", vec![]).await);
    }
    harness.wait_for(ids[0], TaskState::Started).await;
    assert!(harness.broker.unacked_len() <= 2);

    for id in ids {
        harness.wait_for(id, TaskState::Success).await;
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}
