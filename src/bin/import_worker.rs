//! Chunk consumer process. Run as many of these as the database can take.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use people_import::config::Config;
use people_import::consumer::{supervise, ChunkConsumer};
use people_import::db::Database;
use people_import::db_storage::PgStore;
use people_import::queue::PgQueue;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "people_import=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    // One message in flight per worker: a couple of connections is plenty.
    let db = Database::new(&config.database_url, 2).await?;
    tracing::info!("Database connection pool established");

    let store = Arc::new(PgStore::new(db.pool.clone()));
    let queue = Arc::new(PgQueue::new(db.pool.clone(), config.queue_settings()));
    let consumer = ChunkConsumer::new(store.clone(), store, queue, config.poll_interval());

    tracing::info!("Consuming from queue '{}'", config.import_queue);
    supervise(&consumer, config.restart_backoff(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await;

    Ok(())
}
