use axum::{extract::State, http::StatusCode, routing::get, Router};
use clap::Parser;
use std::sync::Arc;
use taskline_broker::{BrokerMetrics, BrokerServer, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "taskline-broker")]
#[command(about = "Taskline broker and result store service", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

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

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(metrics_port) = args.metrics_port {
        config.metrics_port = Some(metrics_port);
    }

    tracing::info!("Starting broker with config: {:?}", config);

    let server = Arc::new(BrokerServer::new(config.clone())?);

    if let Some(port) = config.metrics_port {
        let metrics = server.metrics();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics, port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_server.shutdown();
        }
    });

    server.run().await?;

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

async fn start_metrics_server(metrics: Arc<BrokerMetrics>, port: u16) -> anyhow::Result<()> {
    async fn metrics_handler(State(metrics): State<Arc<BrokerMetrics>>) -> (StatusCode, String) {
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
