use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskline_broker::{BrokerServer, MemoryBroker, ServerConfig};
use taskline_client::{BlockingProducer, Producer, SubmitOptions};
use taskline_core::{
    ErrorKind, HandlerError, Settings, TaskArgs, TaskError, TaskOptions, TaskRegistry, TaskState,
    TaskValue,
};
use taskline_persistence::MemoryResultStore;
use taskline_worker::{register_builtin_tasks, Worker, WorkerConfig};
use tokio::net::TcpListener;
use tokio::time::Instant;

fn registry(attempts: Arc<AtomicU32>) -> Arc<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    register_builtin_tasks(&mut registry).unwrap();
    registry
        .register_fn(
            "sleepy",
            TaskOptions::new().hard_time_limit(Duration::from_secs(1)),
            |_, _| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(TaskValue::Null)
            },
        )
        .unwrap();
    registry
        .register_fn("nap", TaskOptions::default(), |_, _| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(TaskValue::from("rested"))
        })
        .unwrap();
    registry
        .register_fn("always_transient", TaskOptions::new().max_retries(3), move |_, _| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::transient("dependency down"))
            }
        })
        .unwrap();
    registry
        .register_fn("divide", TaskOptions::default(), |_, args| async move {
            let a = args
                .get(0, "a")
                .and_then(TaskValue::as_i64)
                .ok_or_else(|| HandlerError::fatal("missing a"))?;
            let b = args
                .get(1, "b")
                .and_then(TaskValue::as_i64)
                .ok_or_else(|| HandlerError::fatal("missing b"))?;
            if b == 0 {
                return Err(HandlerError::fatal("division by zero"));
            }
            Ok(TaskValue::Int(a / b))
        })
        .unwrap();
    Arc::new(registry)
}

fn settings() -> Settings {
    Settings {
        task_default_retry_delay: 0.5,
        result_poll_interval_ms: 50,
        ..Settings::default()
    }
}

struct Cluster {
    producer: Producer,
    worker: Arc<Worker>,
    attempts: Arc<AtomicU32>,
}

impl Cluster {
    fn start() -> Self {
        let settings = settings();
        let attempts = Arc::new(AtomicU32::new(0));
        let registry = registry(attempts.clone());
        let broker = Arc::new(MemoryBroker::new(settings.visibility_timeout()));
        let store = Arc::new(MemoryResultStore::new());

        let producer = Producer::new(
            settings.clone(),
            registry.clone(),
            broker.clone(),
            store.clone(),
        )
        .unwrap();
        let worker = Arc::new(
            Worker::new(WorkerConfig::new(settings), registry, broker, store).unwrap(),
        );
        tokio::spawn(worker.clone().run());

        Cluster {
            producer,
            worker,
            attempts,
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.worker.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_echo_end_to_end() {
    let cluster = Cluster::start();
    let handle = cluster
        .producer
        .delay("echo", TaskArgs::positional(vec!["hi".into()]))
        .await
        .unwrap();

    let record = handle.wait(Duration::from_secs(5)).await.unwrap();
    assert_eq!(record.status, TaskState::Success);
    assert_eq!(record.result, TaskValue::from("Echo: hi"));

    // Repeated waits on a terminal id see the same record.
    assert_eq!(handle.wait(Duration::from_secs(5)).await.unwrap(), record);
    assert_eq!(handle.get(Duration::ZERO).await.unwrap(), TaskValue::from("Echo: hi"));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_task_is_rejected_on_submit() {
    let cluster = Cluster::start();
    assert_eq!(
        cluster
            .producer
            .delay("nonexistent", TaskArgs::default())
            .await
            .unwrap_err(),
        TaskError::UnknownTask("nonexistent".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_hard_time_limit_end_to_end() {
    let cluster = Cluster::start();
    let started = Instant::now();
    let handle = cluster
        .producer
        .delay("sleepy", TaskArgs::default())
        .await
        .unwrap();

    let record = handle.wait(Duration::from_secs(30)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(record.status, TaskState::Failure);
    assert_eq!(record.failure().unwrap().kind(), ErrorKind::TimeLimitExceeded);
}

#[tokio::test(start_paused = true)]
async fn test_wait_timeout_does_not_cancel_task() {
    let cluster = Cluster::start();
    let handle = cluster.producer.delay("nap", TaskArgs::default()).await.unwrap();

    let started = Instant::now();
    let err = handle.wait(Duration::from_secs(1)).await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1100));
    match err {
        TaskError::TaskTimeout { id, last_state, .. } => {
            assert_eq!(id, handle.id());
            assert_eq!(last_state, TaskState::Started);
        }
        other => panic!("unexpected: {:?}", other),
    }

    let value = handle.get(Duration::from_secs(30)).await.unwrap();
    assert_eq!(value, TaskValue::from("rested"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_stop_after_max_retries() {
    let cluster = Cluster::start();
    let handle = cluster
        .producer
        .delay("always_transient", TaskArgs::default())
        .await
        .unwrap();

    let record = handle.wait(Duration::from_secs(60)).await.unwrap();
    assert_eq!(record.status, TaskState::Failure);
    assert_eq!(record.retries, 3);
    assert_eq!(cluster.attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_handler_failure_surfaces_through_get() {
    let cluster = Cluster::start();
    let ok = cluster
        .producer
        .delay("divide", TaskArgs::positional(vec![9.into(), 3.into()]))
        .await
        .unwrap();
    assert_eq!(ok.get(Duration::from_secs(5)).await.unwrap(), TaskValue::Int(3));

    let bad = cluster
        .producer
        .delay("divide", TaskArgs::positional(vec![1.into(), 0.into()]))
        .await
        .unwrap();
    match bad.get(Duration::from_secs(5)).await {
        Err(TaskError::TaskFailed { id, failure }) => {
            assert_eq!(id, bad.id());
            assert_eq!(failure.kind(), ErrorKind::HandlerError);
            assert_eq!(failure.exc_message, "division by zero");
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_eta_in_future_holds_back_execution() {
    let cluster = Cluster::start();
    let handle = cluster
        .producer
        .submit(
            "echo",
            TaskArgs::positional(vec!["later".into()]),
            SubmitOptions::new().countdown(Duration::from_secs(3)),
        )
        .await
        .unwrap();

    assert!(handle.wait(Duration::from_secs(1)).await.is_err());
    let record = handle.wait(Duration::from_secs(10)).await.unwrap();
    assert_eq!(record.status, TaskState::Success);
}

#[test]
fn test_blocking_bridge_in_eager_mode() {
    let settings = Settings {
        task_always_eager: true,
        ..Settings::default()
    };
    let producer =
        BlockingProducer::connect(settings, registry(Arc::new(AtomicU32::new(0)))).unwrap();
    assert!(producer.producer().is_eager());

    let value = producer
        .call("echo", TaskArgs::positional(vec!["sync".into()]), Duration::ZERO)
        .unwrap();
    assert_eq!(value, TaskValue::from("Echo: sync"));

    let handle = producer
        .delay("divide", TaskArgs::positional(vec![1.into(), 0.into()]))
        .unwrap();
    assert_eq!(producer.status(handle.id()).unwrap().status, TaskState::Failure);
}

#[test]
fn test_blocking_bridge_against_worker_thread() {
    let settings = settings();
    let registry = registry(Arc::new(AtomicU32::new(0)));
    let broker = Arc::new(MemoryBroker::new(settings.visibility_timeout()));
    let store = Arc::new(MemoryResultStore::new());

    let worker = Arc::new(
        Worker::new(
            WorkerConfig::new(settings.clone()),
            registry.clone(),
            broker.clone(),
            store.clone(),
        )
        .unwrap(),
    );
    let background = worker.clone();
    let thread = std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(background.run()).unwrap();
    });

    let inner = Producer::new(settings, registry, broker, store).unwrap();
    let producer = BlockingProducer::new(inner).unwrap();
    let value = producer
        .call("echo", TaskArgs::positional(vec!["bridged".into()]), Duration::from_secs(10))
        .unwrap();
    assert_eq!(value, TaskValue::from("Echo: bridged"));

    worker.shutdown();
    thread.join().unwrap();
}

#[tokio::test]
async fn test_echo_through_broker_service() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(BrokerServer::new(ServerConfig::default()).unwrap());
    tokio::spawn(server.clone().serve(listener));

    let url = format!("taskline://127.0.0.1:{}/e2e", port);
    let settings = Settings {
        broker_url: url.clone(),
        result_backend: url,
        result_poll_interval_ms: 20,
        ..Settings::default()
    };
    let registry = registry(Arc::new(AtomicU32::new(0)));

    let worker =
        Arc::new(Worker::connect(WorkerConfig::new(settings.clone()), registry.clone()).unwrap());
    let running = tokio::spawn(worker.clone().run());
    let producer = Producer::connect(settings, registry).unwrap();

    let handle = producer
        .delay("echo", TaskArgs::positional(vec!["remote".into()]))
        .await
        .unwrap();
    let record = handle.wait(Duration::from_secs(10)).await.unwrap();
    assert_eq!(record.result, TaskValue::from("Echo: remote"));
    assert_eq!(record.status, TaskState::Success);

    worker.shutdown();
    running.await.unwrap().unwrap();
    server.shutdown();
}
