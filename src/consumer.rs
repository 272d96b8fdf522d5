//! Chunk consumer: turns queued chunk messages into committed entities and
//! job progress.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::db_storage::{EntityStore, JobStore};
use crate::errors::ImportError;
use crate::models::{ChunkProgress, ImportJobStatus};
use crate::normalizer::normalize_chunk;
use crate::queue::{Delivery, QueueBroker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Upserts committed and progress recorded.
    Committed(ChunkProgress),
    /// Acknowledged without processing (job gone or message inconsistent).
    Discarded,
    /// Parked on the broker's dead-letter list because its job has failed.
    DeadLettered,
}

pub struct ChunkConsumer {
    jobs: Arc<dyn JobStore>,
    entities: Arc<dyn EntityStore>,
    broker: Arc<dyn QueueBroker>,
    poll_interval: Duration,
}

impl ChunkConsumer {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        entities: Arc<dyn EntityStore>,
        broker: Arc<dyn QueueBroker>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            jobs,
            entities,
            broker,
            poll_interval,
        }
    }

    /// Process one leased message. The message is acknowledged only after
    /// its chunk has been recorded on the job.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<ChunkOutcome, ImportError> {
        let message = &delivery.message;

        let Some(job) = self.jobs.get_job(message.job_id).await? else {
            tracing::warn!(
                "Discarding chunk {} of unknown import job {}",
                message.chunk_index,
                message.job_id
            );
            self.broker.ack(delivery).await?;
            return Ok(ChunkOutcome::Discarded);
        };

        // Kept for inspection instead of acked; the job is never revived.
        if job.status == ImportJobStatus::Failed {
            let reason = format!(
                "import job {} failed: {}",
                job.id,
                job.error_message.as_deref().unwrap_or("unknown error")
            );
            tracing::warn!(
                "Chunk {} (delivery {}) arrived for failed import job {}, dead-lettering",
                message.chunk_index,
                delivery.deliveries,
                job.id
            );
            self.broker.dead_letter(delivery, &reason).await?;
            return Ok(ChunkOutcome::DeadLettered);
        }

        if message.total_chunks != job.total_chunks
            || !(0..job.total_chunks).contains(&message.chunk_index)
            || message.source != job.source
        {
            tracing::error!(
                "Discarding chunk {}/{} ({}) inconsistent with import job {} ({} chunks, {})",
                message.chunk_index,
                message.total_chunks,
                message.source,
                job.id,
                job.total_chunks,
                job.source
            );
            self.broker.ack(delivery).await?;
            return Ok(ChunkOutcome::Discarded);
        }

        let chunk = normalize_chunk(message.row_fields());

        let stats = match self.entities.apply_chunk(job.source, &chunk.records).await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(
                    "Chunk {} of import job {} rolled back: {}",
                    message.chunk_index,
                    job.id,
                    e
                );
                self.jobs.fail_job(job.id, &e.to_string()).await?;
                self.broker.reject(delivery, &e.to_string()).await?;
                return Err(e);
            }
        };

        let progress = match self
            .jobs
            .record_chunk(
                job.id,
                message.chunk_index,
                chunk.rows_total,
                chunk.skips.total(),
            )
            .await
        {
            Ok(progress) => progress,
            Err(e) => {
                // Upserts are idempotent; a redelivery redoes them and records the chunk.
                self.broker.reject(delivery, &e.to_string()).await?;
                return Err(e);
            }
        };

        tracing::info!(
            "Import job {} chunk {}/{} committed: {} of {} rows stored, {} skipped (national code {}, card {}), {} card(s), {} phone(s)",
            job.id,
            message.chunk_index + 1,
            progress.total_chunks,
            stats.persons,
            chunk.rows_total,
            chunk.skips.total(),
            chunk.skips.bad_national_code,
            chunk.skips.bad_card_number,
            stats.credit_cards,
            stats.phone_numbers
        );

        if !progress.newly_recorded {
            tracing::debug!(
                "Chunk {} of import job {} was already recorded (redelivery)",
                message.chunk_index,
                job.id
            );
        } else if progress.status == ImportJobStatus::Completed {
            tracing::info!(
                "Import job {} completed: {}/{} chunks",
                job.id,
                progress.processed_chunks,
                progress.total_chunks
            );
        }

        self.broker.ack(delivery).await?;
        Ok(ChunkOutcome::Committed(progress))
    }

    /// Lease and process one message. `None` when the queue was empty.
    pub async fn process_next(&self) -> Result<Option<ChunkOutcome>, ImportError> {
        match self.broker.receive().await? {
            Some(delivery) => self.handle_delivery(&delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process messages until the queue is empty. Returns how many were handled.
    pub async fn drain(&self) -> Result<usize, ImportError> {
        let mut handled = 0;
        while self.process_next().await?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }

    /// Consume forever, one message in flight at a time. Returns only on error.
    pub async fn run(&self) -> Result<(), ImportError> {
        tracing::info!("Chunk consumer started");
        loop {
            if self.process_next().await?.is_none() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}

/// Keep `consumer` running, restarting it after `backoff` whenever it stops
/// with an error, until `shutdown` resolves.
pub async fn supervise<F>(consumer: &ChunkConsumer, backoff: Duration, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, stopping chunk consumer");
                return;
            }
            result = consumer.run() => {
                if let Err(e) = result {
                    tracing::error!("Chunk consumer stopped: {}; restarting in {:?}", e, backoff);
                }
            }
        }

        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, stopping chunk consumer");
                return;
            }
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}
