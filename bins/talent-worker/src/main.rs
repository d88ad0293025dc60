use anyhow::Context;
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use std::sync::Arc;
use talent_common::config::AppConfig;
use talent_core::engine::{CodeExecutor, DockerEngine};
use talent_core::evaluator::TestRunner;
use talent_core::metrics;
use talent_core::processors::Processors;
use talent_core::queue::{ConnectionState, QueueService, RedisConnector};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Talent Worker booting...");

    let config = AppConfig::from_env().context("Invalid configuration")?;

    let engine = DockerEngine::new(config.sandbox.clone());
    if let Err(e) = engine.health_check().await {
        // not fatal: jobs fail and retry until the daemon is back
        error!(error = %e, "Docker daemon unreachable");
    }
    for language in talent_common::types::Language::ALL {
        let runtime = config.sandbox.runtimes.get(language);
        info!(language = %language, image = %runtime.image, "Runtime configured");
    }

    let runner = TestRunner::new(Arc::new(engine)).with_parallelism(config.sandbox.parallelism);
    let queue = Arc::new(QueueService::new(
        Arc::new(RedisConnector::new(config.redis.connection_info())),
        Processors::standard(Arc::new(runner)),
        config.queue.clone(),
    ));

    if queue.connect().await != ConnectionState::Connected {
        warn!("Broker unreachable at startup, workers idle until it comes back");
    }
    queue.start_workers().await;
    queue.spawn_reconnect_loop().await;

    let health = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(queue.clone());
    let listener = TcpListener::bind(&config.worker_health_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.worker_health_addr))?;
    info!("Health endpoint listening on {}", config.worker_health_addr);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health).await {
            error!(error = %e, "Health server failed");
        }
    });

    signal::ctrl_c().await.context("Failed to install CTRL+C signal handler")?;
    warn!("Received shutdown signal, draining workers...");

    queue.shutdown().await;
    server.abort();
    info!("Worker shutdown complete");
    Ok(())
}

async fn health_check(State(queue): State<Arc<QueueService>>) -> impl IntoResponse {
    let broker = match queue.state() {
        ConnectionState::Connected => "connected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Disconnected => "disconnected",
    };
    Json(serde_json::json!({ "status": "ok", "broker": broker }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
