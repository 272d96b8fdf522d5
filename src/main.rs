use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use people_import::config::Config;
use people_import::db::Database;
use people_import::db_storage::PgStore;
use people_import::handlers::{self, AppState};
use people_import::orchestrator::{ChunkOrchestrator, ImportDispatcher};
use people_import::queue::PgQueue;

/// Submission server.
///
/// Accepts import jobs over HTTP, orchestrates them on a bounded background
/// pool and serves job status. Chunk consumption happens in `import-worker`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "people_import=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let db = Database::new(&config.database_url, 10).await?;
    tracing::info!("Database connection pool established");

    let store = Arc::new(PgStore::new(db.pool.clone()));
    let queue = Arc::new(PgQueue::new(db.pool.clone(), config.queue_settings()));
    let orchestrator = Arc::new(ChunkOrchestrator::new(
        store.clone(),
        queue,
        config.row_extractor()?,
    ));
    let dispatcher = ImportDispatcher::new(orchestrator, config.max_concurrent_imports);

    let resumed = dispatcher.resume_pending().await?;
    if resumed > 0 {
        tracing::info!("Re-dispatched {} pending import job(s)", resumed);
    }

    let app_state = Arc::new(AppState {
        jobs: store,
        dispatcher,
    });

    let api_routes = Router::new()
        .route("/api/v1/imports", post(handlers::submit_import))
        .route("/api/v1/imports/:id", get(handlers::get_import_job))
        .layer(RequestBodyLimitLayer::new(64 * 1024));

    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(api_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
