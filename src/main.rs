//! account-ledger projection daemon
//!
//! Tails the event log's change stream and keeps the read stores current.
//! The command service is a library API hosted by the ingress layer; this
//! binary owns the read side: shard workers, checkpoints, projections.

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use account_ledger::projection::{
    KvProjection, PostgresKvStore, ProjectionTarget, Projector, RelationalProjection,
};
use account_ledger::stream::{PostgresChangeStream, PostgresCheckpointStore, StreamConsumer};
use account_ledger::{db, Config};

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "account_ledger=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;

    tracing::info!("Starting account-ledger projection daemon");
    tracing::info!("Connecting to database...");

    let pool = db::connect(&config.database_url, config.database_max_connections).await?;

    if !db::check_schema(&pool).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }
    tracing::info!("Database connected successfully");

    let stream = Arc::new(PostgresChangeStream::new(
        pool.clone(),
        config.stream_shard_count,
    ));
    let checkpoints = Arc::new(PostgresCheckpointStore::new(pool.clone()));
    let projector = Arc::new(Projector::new(
        vec![
            Arc::new(KvProjection::new(Arc::new(PostgresKvStore::new(
                pool.clone(),
            )))) as Arc<dyn ProjectionTarget>,
            Arc::new(RelationalProjection::new(pool.clone())) as Arc<dyn ProjectionTarget>,
        ],
        config.call_timeout(),
    ));

    let consumer = StreamConsumer::new(stream, checkpoints, projector, config.consumer_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_task = tokio::spawn(consumer.run(shutdown_rx));

    shutdown_signal().await;
    tracing::info!("Shutdown signalled, draining shard workers...");
    let _ = shutdown_tx.send(true);
    consumer_task.await?;

    pool.close().await;
    tracing::info!("Database connections closed. Goodbye!");

    Ok(())
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
