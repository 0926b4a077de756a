use std::sync::Arc;

use anyhow::{Context, Result};
use eventline_core::InMemoryStore;
use eventline_storage::Database;
use eventline_worker::{
    routes, telemetry, ApiState, FanoutContext, HttpTransport, WorkerConfig, WorkerPool,
    WorkerPoolConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let config = WorkerConfig::from_env()?;
    tracing::info!(worker_id = %config.worker_id, "eventline-worker starting...");

    let transport = Arc::new(HttpTransport::new(config.webhook_timeout)?);

    let context = match &config.database_url {
        Some(url) => {
            let db = Database::from_url(url, config.max_concurrent_tasks as u32 + 2)
                .await
                .context("failed to connect to database")?;
            db.migrate().await?;
            tracing::info!("using PostgreSQL store");
            FanoutContext::from_store(Arc::new(db), transport, &config.fanout)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            FanoutContext::from_store(Arc::new(InMemoryStore::new()), transport, &config.fanout)
        }
    };

    let pool = WorkerPool::new(context.clone(), WorkerPoolConfig::from_worker_config(&config));
    pool.start()?;

    let app = routes(ApiState::from_context(&context));
    let listener = tokio::net::TcpListener::bind(config.api_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.api_addr))?;
    tracing::info!(addr = %config.api_addr, "API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    pool.shutdown().await?;
    tracing::info!("worker shutdown complete");
    Ok(())
}
