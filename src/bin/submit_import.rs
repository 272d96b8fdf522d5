//! Operator utility: create an import job and orchestrate it inline.
//!
//! Usage: `submit-import <file_path> <source>`

use std::env;
use std::sync::Arc;

use people_import::config::Config;
use people_import::db::Database;
use people_import::db_storage::{JobStore, PgStore};
use people_import::models::{ImportJobResponse, Source};
use people_import::orchestrator::ChunkOrchestrator;
use people_import::queue::PgQueue;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "people_import=info".into()),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let [file_path, source] = args.as_slice() else {
        anyhow::bail!("usage: submit-import <file_path> <source>");
    };
    let source: Source = source.parse().map_err(|e: String| anyhow::anyhow!(e))?;

    let config = Config::from_env()?;
    let db = Database::new(&config.database_url, 2).await?;

    let store = Arc::new(PgStore::new(db.pool.clone()));
    let queue = Arc::new(PgQueue::new(db.pool.clone(), config.queue_settings()));
    let orchestrator = ChunkOrchestrator::new(store.clone(), queue, config.row_extractor()?);

    let job = store.create_job(file_path, source).await?;
    println!("Created import job {}", job.id);

    let outcome = orchestrator.orchestrate(&job).await;
    if let Some(job) = store.get_job(job.id).await? {
        println!("{}", serde_json::to_string_pretty(&ImportJobResponse::from(job))?);
    }
    outcome?;

    Ok(())
}
