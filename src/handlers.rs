use crate::db_storage::JobStore;
use crate::errors::AppError;
use crate::models::*;
use crate::orchestrator::ImportDispatcher;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use std::sync::Arc;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Job persistence, used for status reads.
    pub jobs: Arc<dyn JobStore>,
    /// Background orchestration pool for submitted jobs.
    pub dispatcher: ImportDispatcher,
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "people-import",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// POST /api/v1/imports
///
/// Creates a PENDING job and schedules its orchestration. Problems with the
/// file itself surface later on the job record, never on this response.
pub async fn submit_import(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitImportRequest>,
) -> Result<(StatusCode, Json<SubmitImportResponse>), AppError> {
    tracing::info!(
        "POST /imports - file: {}, source: {}",
        request.file_path,
        request.source
    );

    if request.file_path.trim().is_empty() {
        return Err(AppError::BadRequest("file_path is required".to_string()));
    }

    let job = state
        .dispatcher
        .submit(request.file_path.trim(), request.source)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitImportResponse {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

/// GET /api/v1/imports/:id
pub async fn get_import_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<i64>,
) -> Result<Json<ImportJobResponse>, AppError> {
    let job = state
        .jobs
        .get_job(job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("import job {}", job_id)))?;

    Ok(Json(ImportJobResponse::from(job)))
}
