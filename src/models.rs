use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use std::fmt;
use std::str::FromStr;

/// Number of data rows carried by one chunk message.
///
/// Orchestrator and consumer both read this constant; it bounds the size of
/// a single chunk transaction (a few thousand upserts at most) while keeping
/// the per-message overhead of the queue low.
pub const CHUNK_SIZE: usize = 1_000;

/// Canonical positional columns of an import file.
pub const IMPORT_COLUMNS: [&str; 5] = [
    "NATIONAL_CODE",
    "CARD_NO",
    "FULL_NAME",
    "BIRTH_DATE",
    "MOBILE",
];

// ============ Enumerations ============

/// Upstream dataset a record was imported from.
///
/// The same national code may exist once per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    Unknown,
    Melli,
    Saderat,
    Mellat,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Unknown => "UNKNOWN",
            Source::Melli => "MELLI",
            Source::Saderat => "SADERAT",
            Source::Mellat => "MELLAT",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNKNOWN" => Ok(Source::Unknown),
            "MELLI" => Ok(Source::Melli),
            "SADERAT" => Ok(Source::Saderat),
            "MELLAT" => Ok(Source::Mellat),
            other => Err(format!("unknown source '{}'", other)),
        }
    }
}

/// Lifecycle of an import job.
///
/// Transitions only move forward: PENDING -> PROCESSING -> COMPLETED | FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImportJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportJobStatus::Pending => "PENDING",
            ImportJobStatus::Processing => "PROCESSING",
            ImportJobStatus::Completed => "COMPLETED",
            ImportJobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportJobStatus::Completed | ImportJobStatus::Failed)
    }
}

impl FromStr for ImportJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ImportJobStatus::Pending),
            "PROCESSING" => Ok(ImportJobStatus::Processing),
            "COMPLETED" => Ok(ImportJobStatus::Completed),
            "FAILED" => Ok(ImportJobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

fn decode_column<T: FromStr<Err = String>>(row: &PgRow, column: &str) -> sqlx::Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: e.into(),
    })
}

// ============ Database Models ============

/// A person identified by national code within one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    /// Always exactly 10 ASCII digits.
    pub national_code: String,
    pub source: Source,
    /// Holds the whole (repaired) full name.
    pub first_name: String,
    /// Never populated by imports.
    pub last_name: Option<String>,
    pub birthdate: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for Person {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            national_code: row.try_get("national_code")?,
            source: decode_column(row, "source")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            birthdate: row.try_get("birthdate")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A 16-digit card owned by a person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditCard {
    pub id: i64,
    pub card_number: String,
    pub source: Source,
    pub person_id: i64,
}

impl<'r> FromRow<'r, PgRow> for CreditCard {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            card_number: row.try_get("card_number")?,
            source: decode_column(row, "source")?,
            person_id: row.try_get("person_id")?,
        })
    }
}

/// A phone number, unique per (number, person, source).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub id: i64,
    pub number: String,
    pub person_id: i64,
    pub source: Source,
}

impl<'r> FromRow<'r, PgRow> for PhoneNumber {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            number: row.try_get("number")?,
            person_id: row.try_get("person_id")?,
            source: decode_column(row, "source")?,
        })
    }
}

/// Persisted record of one import run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: i64,
    pub source: Source,
    pub file_path: String,
    pub status: ImportJobStatus,
    pub total_chunks: i32,
    pub processed_chunks: i32,
    /// Rows excluded by the normalizer, summed over committed chunks.
    pub skipped_rows: i64,
    pub total_rows: Option<i64>,
    pub detected_encoding: Option<String>,
    pub header_detected: Option<bool>,
    pub file_sha256: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    /// Share of chunks committed so far, in percent.
    pub fn completion_percentage(&self) -> f64 {
        if self.total_chunks == 0 {
            return if self.status == ImportJobStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.processed_chunks as f64 / self.total_chunks as f64) * 100.0
    }
}

impl<'r> FromRow<'r, PgRow> for ImportJob {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            source: decode_column(row, "source")?,
            file_path: row.try_get("file_path")?,
            status: decode_column(row, "status")?,
            total_chunks: row.try_get("total_chunks")?,
            processed_chunks: row.try_get("processed_chunks")?,
            skipped_rows: row.try_get("skipped_rows")?,
            total_rows: row.try_get("total_rows")?,
            detected_encoding: row.try_get("detected_encoding")?,
            header_detected: row.try_get("header_detected")?,
            file_sha256: row.try_get("file_sha256")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// What the orchestrator learned about a file, stored on the job when it
/// starts processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSummary {
    pub total_chunks: i32,
    pub total_rows: i64,
    pub detected_encoding: String,
    pub header_detected: bool,
    pub file_sha256: String,
}

/// Job counters after a chunk completion was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub status: ImportJobStatus,
    pub processed_chunks: i32,
    pub total_chunks: i32,
    /// False when this chunk index had already been recorded (redelivery).
    pub newly_recorded: bool,
}

// ============ Queue Models ============

/// One chunk of raw rows, as published to the import queue.
///
/// Each row maps column name to raw cell text in file column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMessage {
    pub job_id: i64,
    pub source: Source,
    pub chunk_index: i32,
    pub total_chunks: i32,
    pub rows: Vec<Map<String, Value>>,
}

impl ChunkMessage {
    /// Positional field values of every row, in column order.
    pub fn row_fields(&self) -> impl Iterator<Item = Vec<String>> + '_ {
        self.rows.iter().map(|row| {
            row.values()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .collect()
        })
    }
}

// ============ API Models ============

/// Body of `POST /api/v1/imports`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitImportRequest {
    pub file_path: String,
    pub source: Source,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitImportResponse {
    pub job_id: i64,
    pub status: ImportJobStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportJobResponse {
    #[serde(flatten)]
    pub job: ImportJob,
    pub completion_percentage: f64,
}

impl From<ImportJob> for ImportJobResponse {
    fn from(job: ImportJob) -> Self {
        let completion_percentage = job.completion_percentage();
        Self {
            job,
            completion_percentage,
        }
    }
}
