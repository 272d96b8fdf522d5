//! Job orchestration: read the file, split it into chunks, publish them.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::db_storage::JobStore;
use crate::errors::ImportError;
use crate::extractor::{ExtractedRows, RowExtractor};
use crate::models::{ChunkMessage, ExtractionSummary, ImportJob, Source, CHUNK_SIZE, IMPORT_COLUMNS};
use crate::queue::QueueBroker;

/// How an orchestration run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestrationOutcome {
    Published { total_chunks: i32, total_rows: i64 },
    /// Another orchestrator already claimed the job.
    NotPending,
    /// The job left PROCESSING while the file was being read.
    Abandoned,
}

/// `ceil(rows / CHUNK_SIZE)`.
pub fn chunk_count(rows: usize) -> usize {
    rows.div_ceil(CHUNK_SIZE)
}

/// Column names for chunk rows.
///
/// Header cells are used when present; blank or missing ones fall back to
/// the canonical column name for that position. Repeated names get a
/// positional suffix so no field is lost.
pub fn column_names(header: Option<&[String]>, width: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    (0..width)
        .map(|idx| {
            let name = header
                .and_then(|h| h.get(idx))
                .map(|cell| cell.trim().to_string())
                .filter(|cell| !cell.is_empty())
                .unwrap_or_else(|| match IMPORT_COLUMNS.get(idx) {
                    Some(name) => name.to_string(),
                    None => format!("COLUMN_{}", idx + 1),
                });
            if seen.insert(name.clone()) {
                name
            } else {
                let unique = format!("{}_{}", name, idx + 1);
                seen.insert(unique.clone());
                unique
            }
        })
        .collect()
}

/// Number of chunks stored on the job for `rows` data rows.
pub fn total_chunks(rows: usize) -> Result<i32, ImportError> {
    i32::try_from(chunk_count(rows)).map_err(|_| ImportError::TooManyRows(rows))
}

/// Split extracted data rows into chunk messages, building each one only
/// when the iterator reaches it.
pub fn chunk_messages(
    job_id: i64,
    source: Source,
    extracted: &ExtractedRows,
    total_chunks: i32,
) -> impl Iterator<Item = ChunkMessage> + '_ {
    let width = extracted
        .rows
        .iter()
        .map(Vec::len)
        .max()
        .unwrap_or(0)
        .max(IMPORT_COLUMNS.len());
    let columns = column_names(extracted.header(), width);

    extracted
        .data_rows()
        .chunks(CHUNK_SIZE)
        .enumerate()
        .map(move |(chunk_index, rows)| ChunkMessage {
            job_id,
            source,
            chunk_index: chunk_index as i32,
            total_chunks,
            rows: rows
                .iter()
                .map(|row| {
                    columns
                        .iter()
                        .enumerate()
                        .map(|(idx, column)| {
                            let cell = row.get(idx).cloned().unwrap_or_default();
                            (column.clone(), Value::String(cell))
                        })
                        .collect::<Map<String, Value>>()
                })
                .collect(),
        })
}

/// Runs one job from PENDING up to "all chunks published".
pub struct ChunkOrchestrator {
    jobs: Arc<dyn JobStore>,
    broker: Arc<dyn QueueBroker>,
    extractor: Arc<RowExtractor>,
}

impl ChunkOrchestrator {
    pub fn new(jobs: Arc<dyn JobStore>, broker: Arc<dyn QueueBroker>, extractor: RowExtractor) -> Self {
        Self {
            jobs,
            broker,
            extractor: Arc::new(extractor),
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Orchestrate `job`. Any error marks the job FAILED before it is returned.
    pub async fn orchestrate(&self, job: &ImportJob) -> Result<OrchestrationOutcome, ImportError> {
        match self.run(job).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!("Import job {} failed during orchestration: {}", job.id, e);
                if let Err(fail_err) = self.jobs.fail_job(job.id, &e.to_string()).await {
                    tracing::error!("Could not mark import job {} as failed: {}", job.id, fail_err);
                }
                Err(e)
            }
        }
    }

    async fn run(&self, job: &ImportJob) -> Result<OrchestrationOutcome, ImportError> {
        if !self.jobs.begin_processing(job.id).await? {
            tracing::warn!("Import job {} is no longer pending, skipping", job.id);
            return Ok(OrchestrationOutcome::NotPending);
        }

        let extracted = self.extract(&job.file_path).await?;
        let data_rows = extracted.data_rows().len();

        let summary = ExtractionSummary {
            total_chunks: total_chunks(data_rows)?,
            total_rows: data_rows as i64,
            detected_encoding: extracted.encoding.clone(),
            header_detected: extracted.has_header,
            file_sha256: extracted.file_sha256.clone(),
        };
        tracing::info!(
            "Import job {}: {} rows in {} chunk(s), encoding {}, header {}",
            job.id,
            summary.total_rows,
            summary.total_chunks,
            summary.detected_encoding,
            if summary.header_detected { "detected" } else { "absent" }
        );

        // Progress is only meaningful once total_chunks is persisted, so it is
        // written before the first chunk can reach a consumer.
        if self.jobs.record_extraction(job.id, &summary).await?.is_none() {
            tracing::warn!("Import job {} left PROCESSING during extraction", job.id);
            return Ok(OrchestrationOutcome::Abandoned);
        }

        for chunk in chunk_messages(job.id, job.source, &extracted, summary.total_chunks) {
            self.broker.publish(&chunk).await?;
        }

        if summary.total_chunks == 0 {
            tracing::info!("Import job {} has no data rows, completed", job.id);
        } else {
            tracing::info!("Import job {}: published {} chunk(s)", job.id, summary.total_chunks);
        }

        Ok(OrchestrationOutcome::Published {
            total_chunks: summary.total_chunks,
            total_rows: summary.total_rows,
        })
    }

    async fn extract(&self, file_path: &str) -> Result<ExtractedRows, ImportError> {
        let extractor = Arc::clone(&self.extractor);
        let path = PathBuf::from(file_path);
        tokio::task::spawn_blocking(move || extractor.extract(&path))
            .await
            .map_err(|e| ImportError::ExtractionTask(e.to_string()))?
    }
}

/// Bounded pool that runs orchestrations in the background.
#[derive(Clone)]
pub struct ImportDispatcher {
    orchestrator: Arc<ChunkOrchestrator>,
    permits: Arc<Semaphore>,
}

impl ImportDispatcher {
    pub fn new(orchestrator: Arc<ChunkOrchestrator>, max_concurrent: usize) -> Self {
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Create a PENDING job and hand it to the pool.
    pub async fn submit(&self, file_path: &str, source: Source) -> Result<ImportJob, ImportError> {
        let job = self.orchestrator.jobs().create_job(file_path, source).await?;
        tracing::info!("Created import job {} for {} ({})", job.id, file_path, source);
        self.dispatch(job.clone());
        Ok(job)
    }

    pub fn dispatch(&self, job: ImportJob) -> JoinHandle<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::error!("Import pool closed, job {} not orchestrated", job.id);
                return;
            };
            // Failures are already recorded on the job.
            let _ = orchestrator.orchestrate(&job).await;
        })
    }

    /// Re-dispatch jobs that were submitted but never orchestrated.
    pub async fn resume_pending(&self) -> Result<usize, ImportError> {
        let pending = self.orchestrator.jobs().pending_jobs().await?;
        let count = pending.len();
        for job in pending {
            tracing::info!("Resuming pending import job {}", job.id);
            self.dispatch(job);
        }
        Ok(count)
    }
}
