//! Persistence for import jobs and the three identity entities.
//!
//! [`JobStore`] and [`EntityStore`] are the seams the orchestrator and the
//! consumer depend on; [`PgStore`] implements both on PostgreSQL.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use crate::errors::ImportError;
use crate::models::{
    ChunkProgress, CreditCard, ExtractionSummary, ImportJob, ImportJobStatus, Person, PhoneNumber,
    Source,
};
use crate::normalizer::{normalize_phone, NormalizedRecord};

/// Rows touched by one committed chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkWriteStats {
    pub persons: u32,
    pub credit_cards: u32,
    pub phone_numbers: u32,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a PENDING job.
    async fn create_job(&self, file_path: &str, source: Source) -> Result<ImportJob, ImportError>;

    async fn get_job(&self, job_id: i64) -> Result<Option<ImportJob>, ImportError>;

    /// Jobs submitted but never picked up by an orchestrator.
    async fn pending_jobs(&self) -> Result<Vec<ImportJob>, ImportError>;

    /// PENDING -> PROCESSING. Returns false when the job was not pending.
    async fn begin_processing(&self, job_id: i64) -> Result<bool, ImportError>;

    /// Store total chunks and file diagnostics on a PROCESSING job. A job with
    /// zero chunks is completed on the spot. `None` when the job is no longer
    /// processing.
    async fn record_extraction(
        &self,
        job_id: i64,
        summary: &ExtractionSummary,
    ) -> Result<Option<ImportJob>, ImportError>;

    /// Mark `chunk_index` as done, once. Repeated calls for the same index
    /// leave the counters untouched.
    async fn record_chunk(
        &self,
        job_id: i64,
        chunk_index: i32,
        rows_total: u32,
        rows_skipped: u32,
    ) -> Result<ChunkProgress, ImportError>;

    /// Move a non-terminal job to FAILED. Returns false when it was already
    /// terminal.
    async fn fail_job(&self, job_id: i64, error_message: &str) -> Result<bool, ImportError>;
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Upsert every record of a chunk in one transaction.
    async fn apply_chunk(
        &self,
        source: Source,
        records: &[NormalizedRecord],
    ) -> Result<ChunkWriteStats, ImportError>;

    async fn find_person(
        &self,
        national_code: &str,
        source: Source,
    ) -> Result<Option<Person>, ImportError>;

    async fn credit_cards_for(&self, person_id: i64) -> Result<Vec<CreditCard>, ImportError>;

    async fn phone_numbers_for(&self, person_id: i64) -> Result<Vec<PhoneNumber>, ImportError>;

    /// Administrative edit: the person's numbers for `source` become exactly
    /// `numbers` (normalized; unusable entries dropped).
    async fn replace_phone_numbers(
        &self,
        person_id: i64,
        source: Source,
        numbers: &[String],
    ) -> Result<Vec<PhoneNumber>, ImportError>;
}

/// Normalized, de-duplicated phone list for the administrative edit path.
pub(crate) fn normalize_phone_list(numbers: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::new();
    for number in numbers.iter().filter_map(|n| normalize_phone(n)) {
        if !normalized.contains(&number) {
            normalized.push(number);
        }
    }
    normalized
}

/// PostgreSQL-backed job and entity storage.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert_record(
        tx: &mut Transaction<'_, Postgres>,
        source: Source,
        record: &NormalizedRecord,
        stats: &mut ChunkWriteStats,
    ) -> Result<(), sqlx::Error> {
        let person_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO persons (national_code, source, first_name, last_name, birthdate)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (national_code, source) DO UPDATE
            SET first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                birthdate = EXCLUDED.birthdate,
                updated_at = now()
            RETURNING id
            "#,
        )
        .bind(&record.national_code)
        .bind(source.as_str())
        .bind(&record.first_name)
        .bind(&record.last_name)
        .bind(record.birthdate)
        .fetch_one(&mut **tx)
        .await?;
        stats.persons += 1;

        if let Some(card_number) = &record.card_number {
            sqlx::query(
                r#"
                INSERT INTO credit_cards (card_number, source, person_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (card_number, source) DO UPDATE
                SET person_id = EXCLUDED.person_id
                "#,
            )
            .bind(card_number)
            .bind(source.as_str())
            .bind(person_id)
            .execute(&mut **tx)
            .await?;
            stats.credit_cards += 1;
        }

        for number in &record.phone_numbers {
            sqlx::query(
                r#"
                INSERT INTO phone_numbers (number, person_id, source)
                VALUES ($1, $2, $3)
                ON CONFLICT (number, person_id, source) DO NOTHING
                "#,
            )
            .bind(number)
            .bind(person_id)
            .bind(source.as_str())
            .execute(&mut **tx)
            .await?;
            stats.phone_numbers += 1;
        }

        Ok(())
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(&self, file_path: &str, source: Source) -> Result<ImportJob, ImportError> {
        let job = sqlx::query_as::<_, ImportJob>(
            r#"
            INSERT INTO import_jobs (source, file_path, status)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(source.as_str())
        .bind(file_path)
        .bind(ImportJobStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<ImportJob>, ImportError> {
        let job = sqlx::query_as::<_, ImportJob>("SELECT * FROM import_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn pending_jobs(&self) -> Result<Vec<ImportJob>, ImportError> {
        let jobs = sqlx::query_as::<_, ImportJob>(
            "SELECT * FROM import_jobs WHERE status = $1 ORDER BY id",
        )
        .bind(ImportJobStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn begin_processing(&self, job_id: i64) -> Result<bool, ImportError> {
        let result = sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = $2, updated_at = now()
            WHERE id = $1 AND status = $3
            "#,
        )
        .bind(job_id)
        .bind(ImportJobStatus::Processing.as_str())
        .bind(ImportJobStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_extraction(
        &self,
        job_id: i64,
        summary: &ExtractionSummary,
    ) -> Result<Option<ImportJob>, ImportError> {
        let job = sqlx::query_as::<_, ImportJob>(
            r#"
            UPDATE import_jobs
            SET total_chunks = $2,
                total_rows = $3,
                detected_encoding = $4,
                header_detected = $5,
                file_sha256 = $6,
                status = CASE WHEN $2 = 0 THEN 'COMPLETED' ELSE status END,
                updated_at = now()
            WHERE id = $1 AND status = 'PROCESSING'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(summary.total_chunks)
        .bind(summary.total_rows)
        .bind(&summary.detected_encoding)
        .bind(summary.header_detected)
        .bind(&summary.file_sha256)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn record_chunk(
        &self,
        job_id: i64,
        chunk_index: i32,
        rows_total: u32,
        rows_skipped: u32,
    ) -> Result<ChunkProgress, ImportError> {
        // Insert-once into the completed set and bump the counter in the same
        // statement; the row lock on import_jobs serializes concurrent workers
        // and the CASE sees the post-increment value.
        let row: Option<(String, i32, i32, i64)> = sqlx::query_as(
            r#"
            WITH recorded AS (
                INSERT INTO import_job_chunks (job_id, chunk_index, rows_total, rows_skipped)
                SELECT $1, $2, $3, $4
                WHERE EXISTS (
                    SELECT 1 FROM import_jobs
                    WHERE id = $1 AND $2 >= 0 AND $2 < total_chunks
                )
                ON CONFLICT (job_id, chunk_index) DO NOTHING
                RETURNING rows_skipped
            )
            UPDATE import_jobs j
            SET processed_chunks = j.processed_chunks + (SELECT COUNT(*) FROM recorded)::int,
                skipped_rows = j.skipped_rows + COALESCE((SELECT SUM(rows_skipped) FROM recorded), 0),
                status = CASE
                    WHEN j.status = 'PROCESSING'
                     AND j.processed_chunks + (SELECT COUNT(*) FROM recorded)::int >= j.total_chunks
                    THEN 'COMPLETED'
                    ELSE j.status
                END,
                updated_at = now()
            WHERE j.id = $1
            RETURNING j.status, j.processed_chunks, j.total_chunks,
                      (SELECT COUNT(*) FROM recorded) AS newly_recorded
            "#,
        )
        .bind(job_id)
        .bind(chunk_index)
        .bind(rows_total as i32)
        .bind(rows_skipped as i32)
        .fetch_optional(&self.pool)
        .await?;

        let (status, processed_chunks, total_chunks, newly_recorded) =
            row.ok_or(ImportError::JobNotFound(job_id))?;

        Ok(ChunkProgress {
            status: status.parse().map_err(|e: String| {
                ImportError::Database(sqlx::Error::Decode(e.into()))
            })?,
            processed_chunks,
            total_chunks,
            newly_recorded: newly_recorded > 0,
        })
    }

    async fn fail_job(&self, job_id: i64, error_message: &str) -> Result<bool, ImportError> {
        let result = sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = 'FAILED', error_message = $2, updated_at = now()
            WHERE id = $1 AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(job_id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn apply_chunk(
        &self,
        source: Source,
        records: &[NormalizedRecord],
    ) -> Result<ChunkWriteStats, ImportError> {
        let mut stats = ChunkWriteStats::default();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ImportError::Transaction(e.to_string()))?;

        for record in records {
            if let Err(e) = Self::upsert_record(&mut tx, source, record, &mut stats).await {
                tracing::error!(
                    "Upsert failed for national code {} ({}): {}",
                    record.national_code,
                    source,
                    e
                );
                // Dropping the transaction rolls it back.
                return Err(ImportError::Transaction(e.to_string()));
            }
        }

        tx.commit()
            .await
            .map_err(|e| ImportError::Transaction(e.to_string()))?;

        Ok(stats)
    }

    async fn find_person(
        &self,
        national_code: &str,
        source: Source,
    ) -> Result<Option<Person>, ImportError> {
        let person = sqlx::query_as::<_, Person>(
            "SELECT * FROM persons WHERE national_code = $1 AND source = $2",
        )
        .bind(national_code)
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(person)
    }

    async fn credit_cards_for(&self, person_id: i64) -> Result<Vec<CreditCard>, ImportError> {
        let cards = sqlx::query_as::<_, CreditCard>(
            "SELECT * FROM credit_cards WHERE person_id = $1 ORDER BY id",
        )
        .bind(person_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(cards)
    }

    async fn phone_numbers_for(&self, person_id: i64) -> Result<Vec<PhoneNumber>, ImportError> {
        let numbers = sqlx::query_as::<_, PhoneNumber>(
            "SELECT * FROM phone_numbers WHERE person_id = $1 ORDER BY id",
        )
        .bind(person_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(numbers)
    }

    async fn replace_phone_numbers(
        &self,
        person_id: i64,
        source: Source,
        numbers: &[String],
    ) -> Result<Vec<PhoneNumber>, ImportError> {
        let numbers = normalize_phone_list(numbers);
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM phone_numbers WHERE person_id = $1 AND source = $2")
            .bind(person_id)
            .bind(source.as_str())
            .execute(&mut *tx)
            .await?;

        let mut stored = Vec::with_capacity(numbers.len());
        for number in &numbers {
            let phone = sqlx::query_as::<_, PhoneNumber>(
                r#"
                INSERT INTO phone_numbers (number, person_id, source)
                VALUES ($1, $2, $3)
                RETURNING *
                "#,
            )
            .bind(number)
            .bind(person_id)
            .bind(source.as_str())
            .fetch_one(&mut *tx)
            .await?;
            stored.push(phone);
        }

        tx.commit().await?;

        tracing::info!(
            "Replaced phone numbers for person {} ({}): {} number(s)",
            person_id,
            source,
            stored.len()
        );

        Ok(stored)
    }
}
