//! Bulk identity-record import pipeline.
//!
//! Import files (CSV/TXT, XLSX/XLSM) are read by an orchestrator, split into
//! fixed-size chunks and published to a durable queue. Consumer workers
//! normalize each chunk and merge it into the `persons`, `credit_cards` and
//! `phone_numbers` tables with idempotent upserts, recording per-job progress.
//!
//! # Modules
//!
//! - `config`: Configuration management.
//! - `consumer`: Chunk consumer and its supervisor.
//! - `db`: Database connection, pool and migrations.
//! - `db_storage`: Job and entity storage on PostgreSQL.
//! - `errors`: Error handling types.
//! - `extractor`: File reading, encoding detection, header detection.
//! - `handlers`: HTTP request handlers.
//! - `memory`: In-memory store and queue.
//! - `models`: Core data models.
//! - `normalizer`: Row normalization rules.
//! - `orchestrator`: Chunking, publishing and the import pool.
//! - `queue`: Durable chunk queue.

pub mod config;
pub mod consumer;
pub mod db;
pub mod db_storage;
pub mod errors;
pub mod extractor;
pub mod handlers;
pub mod memory;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod queue;
