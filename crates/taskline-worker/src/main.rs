use axum::{extract::State, http::StatusCode, routing::get, Router};
use clap::Parser;
use std::sync::Arc;
use taskline_core::{Settings, TaskRegistry};
use taskline_worker::{register_builtin_tasks, Worker, WorkerConfig, WorkerMetrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "taskline-worker")]
#[command(about = "Taskline worker pool", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Number of execution units
    #[arg(short = 'n', long)]
    concurrency: Option<usize>,

    /// Queues to consume, comma separated (default: every queue a task routes to)
    #[arg(short = 'Q', long, value_delimiter = ',')]
    queues: Vec<String>,

    /// Prometheus metrics port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(args.log_json);

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(concurrency) = args.concurrency {
        settings.worker_concurrency = concurrency;
    }
    if settings.broker_url.starts_with("memory://") {
        tracing::warn!("memory:// broker is private to this process; no producer can reach it");
    }

    let mut config = WorkerConfig::new(settings);
    if let Some(worker_id) = args.worker_id {
        config = config.with_worker_id(worker_id);
    }
    if !args.queues.is_empty() {
        config = config.with_queues(args.queues);
    }

    let mut registry = TaskRegistry::new();
    register_builtin_tasks(&mut registry)?;

    let worker = Arc::new(Worker::connect(config, Arc::new(registry))?);

    if let Some(port) = args.metrics_port {
        let metrics = worker.metrics();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics, port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    let shutdown = worker.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    worker.run().await?;

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

async fn start_metrics_server(metrics: Arc<WorkerMetrics>, port: u16) -> anyhow::Result<()> {
    async fn metrics_handler(State(metrics): State<Arc<WorkerMetrics>>) -> (StatusCode, String) {
        match metrics.encode() {
            Ok(body) => (StatusCode::OK, body),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Metrics server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
