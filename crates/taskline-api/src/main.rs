use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use taskline_api::{router, AppState};
use taskline_broker::MemoryBroker;
use taskline_client::Producer;
use taskline_core::{Settings, TaskRegistry};
use taskline_persistence::MemoryResultStore;
use taskline_worker::{register_builtin_tasks, Worker, WorkerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "taskline-api")]
#[command(about = "Taskline HTTP trigger endpoint", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Listen host
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Listen port
    #[arg(short, long, default_value = "8000")]
    port: u16,

    /// Seconds to wait for a result when the request names no timeout
    #[arg(long, default_value = "5")]
    default_timeout: u64,

    /// Longest wait a request may ask for, in seconds
    #[arg(long, default_value = "60")]
    max_timeout: u64,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(args.log_json);

    let settings = Settings::load(args.config.as_deref())?;
    let mut registry = TaskRegistry::new();
    register_builtin_tasks(&mut registry)?;
    let registry = Arc::new(registry);

    let mut embedded = None;
    let producer = if settings.broker_url.starts_with("memory://") && !settings.task_always_eager {
        // An in-process broker is only reachable from this process, so the
        // workers have to live here too.
        tracing::info!("memory:// broker configured, running an embedded worker pool");
        let broker = Arc::new(MemoryBroker::new(settings.visibility_timeout()));
        let store = Arc::new(MemoryResultStore::new());
        let worker = Arc::new(Worker::new(
            WorkerConfig::new(settings.clone()),
            registry.clone(),
            broker.clone(),
            store.clone(),
        )?);
        embedded = Some((worker.clone(), tokio::spawn(worker.run())));
        Producer::new(settings, registry, broker, store)?
    } else {
        Producer::connect(settings, registry)?
    };

    let mut state = AppState::new(Arc::new(producer));
    state.default_timeout = Duration::from_secs(args.default_timeout);
    state.max_timeout = Duration::from_secs(args.max_timeout);

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Received shutdown signal");
        })
        .await?;

    if let Some((worker, handle)) = embedded {
        worker.shutdown();
        handle.await??;
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}
