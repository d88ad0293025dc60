mod handlers;
mod routes;

use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use talent_common::config::AppConfig;
use talent_core::cache::{RedisCacheStore, ResultCache};
use talent_core::controllers::{CodeExecutionController, ExamController};
use talent_core::engine::DockerEngine;
use talent_core::evaluator::TestRunner;
use talent_core::problems::{CachedProblemStore, InMemoryProblemStore, ProblemStore};
use talent_core::processors::Processors;
use talent_core::queue::{QueueService, RedisConnector};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub struct AppState {
    pub code: CodeExecutionController,
    pub exams: ExamController,
    pub queue: Arc<QueueService>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Talent API booting...");

    let config = AppConfig::from_env().context("Invalid configuration")?;

    // The API runs jobs itself whenever the broker is down
    let engine = DockerEngine::new(config.sandbox.clone());
    let runner = TestRunner::new(Arc::new(engine)).with_parallelism(config.sandbox.parallelism);
    let processors = Processors::standard(Arc::new(runner));

    info!(redis = %config.redis.addr(), "Using Redis");
    let queue = Arc::new(QueueService::new(
        Arc::new(RedisConnector::new(config.redis.connection_info())),
        processors,
        config.queue.clone(),
    ));
    queue.connect().await;
    queue.spawn_reconnect_loop().await;

    let cache = match RedisCacheStore::connect(config.redis.connection_info()).await {
        Ok(store) => ResultCache::new(Arc::new(store), config.cache_ttl),
        Err(e) => {
            warn!(error = %e, "Cache unavailable, serving without cache");
            ResultCache::disabled(config.cache_ttl)
        }
    };
    let problems: Arc<dyn ProblemStore> = Arc::new(CachedProblemStore::new(
        Arc::new(InMemoryProblemStore::load(&config.problems_file)?),
        Arc::new(cache),
    ));

    let state = Arc::new(AppState {
        code: CodeExecutionController::new(queue.clone(), problems),
        exams: ExamController::new(queue.clone()),
        queue: queue.clone(),
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&config.api_bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api_bind_addr))?;
    info!("HTTP server listening on {}", config.api_bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    queue.shutdown().await;
    info!("API shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
