use std::env;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use uuid::Uuid;

use people_import::consumer::{ChunkConsumer, ChunkOutcome};
use people_import::db::Database;
use people_import::db_storage::{EntityStore, JobStore, PgStore};
use people_import::models::{ChunkMessage, ExtractionSummary, ImportJobStatus, Source};
use people_import::normalizer::NormalizedRecord;
use people_import::queue::{PgQueue, QueueBroker, QueueSettings, RejectOutcome};

// These tests need a disposable PostgreSQL database; set TEST_DATABASE_URL to run them.

async fn database() -> anyhow::Result<Database> {
    let db_url = env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL or DATABASE_URL to run this test"))?;
    Database::new(&db_url, 5).await
}

/// A national code unlikely to collide across repeated runs.
fn unique_national_code() -> String {
    format!("{:010}", Uuid::new_v4().as_u128() % 10_000_000_000)
}

fn isolated_queue(db: &Database, max_deliveries: i32) -> PgQueue {
    PgQueue::new(
        db.pool.clone(),
        QueueSettings {
            queue_name: format!("test_{}", Uuid::new_v4().simple()),
            lease: Duration::from_secs(60),
            max_deliveries,
            retry_delay: Duration::ZERO,
        },
    )
}

fn summary(total_chunks: i32) -> ExtractionSummary {
    ExtractionSummary {
        total_chunks,
        total_rows: i64::from(total_chunks) * 10,
        detected_encoding: "UTF-8".into(),
        header_detected: true,
        file_sha256: "0".repeat(64),
    }
}

#[tokio::test]
#[ignore]
async fn chunk_upserts_are_idempotent() -> anyhow::Result<()> {
    let db = database().await?;
    let store = PgStore::new(db.pool.clone());
    let national_code = unique_national_code();
    let card_number = format!("6{:015}", Uuid::new_v4().as_u128() % 10u128.pow(15));

    let record = NormalizedRecord {
        national_code: national_code.clone(),
        card_number: Some(card_number.clone()),
        first_name: "Test Person".into(),
        last_name: None,
        birthdate: None,
        phone_numbers: vec!["09123456789".into()],
    };

    store.apply_chunk(Source::Melli, &[record.clone()]).await?;
    store
        .apply_chunk(Source::Melli, &[record.clone(), record])
        .await?;

    let person = store
        .find_person(&national_code, Source::Melli)
        .await?
        .expect("person stored");
    assert_eq!(person.first_name, "Test Person");
    assert_eq!(store.credit_cards_for(person.id).await?.len(), 1);
    assert_eq!(store.phone_numbers_for(person.id).await?.len(), 1);

    let replaced = store
        .replace_phone_numbers(person.id, Source::Melli, &["9351112233".to_string()])
        .await?;
    assert_eq!(replaced.len(), 1);
    assert_eq!(replaced[0].number, "09351112233");
    Ok(())
}

#[tokio::test]
#[ignore]
async fn concurrent_chunk_recording_completes_exactly_once() -> anyhow::Result<()> {
    let db = database().await?;
    let store = Arc::new(PgStore::new(db.pool.clone()));

    let job = store.create_job("/tmp/concurrent.csv", Source::Saderat).await?;
    assert!(store.begin_processing(job.id).await?);
    store
        .record_extraction(job.id, &summary(8))
        .await?
        .expect("job still processing");

    // Every chunk recorded twice, all at once.
    let handles: Vec<_> = (0..16)
        .map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.record_chunk(job.id, i % 8, 10, 1).await })
        })
        .collect();

    let mut newly_recorded = 0;
    for handle in handles {
        if handle.await??.newly_recorded {
            newly_recorded += 1;
        }
    }
    assert_eq!(newly_recorded, 8);

    let job = store.get_job(job.id).await?.expect("job exists");
    assert_eq!(job.processed_chunks, 8);
    assert_eq!(job.skipped_rows, 8);
    assert_eq!(job.status, ImportJobStatus::Completed);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn failed_job_stays_failed() -> anyhow::Result<()> {
    let db = database().await?;
    let store = PgStore::new(db.pool.clone());

    let job = store.create_job("/tmp/failed.csv", Source::Mellat).await?;
    store.begin_processing(job.id).await?;
    store.record_extraction(job.id, &summary(1)).await?;
    assert!(store.fail_job(job.id, "chunk transaction failed").await?);

    let progress = store.record_chunk(job.id, 0, 10, 0).await?;
    assert_eq!(progress.status, ImportJobStatus::Failed);
    assert!(!store.fail_job(job.id, "again").await?);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn queue_leases_retries_and_dead_letters() -> anyhow::Result<()> {
    let db = database().await?;
    let queue = isolated_queue(&db, 2);

    let mut row = Map::new();
    row.insert("Z_FIRST".into(), Value::String("kept first".into()));
    row.insert("A_SECOND".into(), Value::String("kept second".into()));
    let message = ChunkMessage {
        job_id: 1,
        source: Source::Melli,
        chunk_index: 0,
        total_chunks: 1,
        rows: vec![row],
    };
    queue.publish(&message).await?;

    let first = queue.receive().await?.expect("message visible");
    assert_eq!(first.message, message);
    assert!(queue.receive().await?.is_none(), "leased message is hidden");
    assert_eq!(
        first.message.row_fields().next().unwrap(),
        vec!["kept first".to_string(), "kept second".to_string()]
    );

    assert_eq!(queue.reject(&first, "boom").await?, RejectOutcome::Requeued);
    let second = queue.receive().await?.expect("redelivered after retry delay");
    assert_eq!(second.deliveries, 2);
    assert!(!queue.ack(&first).await?, "stale lease cannot ack");
    assert_eq!(
        queue.reject(&second, "boom").await?,
        RejectOutcome::DeadLettered
    );
    assert!(queue.receive().await?.is_none());
    Ok(())
}

#[tokio::test]
#[ignore]
async fn chunk_for_failed_job_is_dead_lettered_in_postgres() -> anyhow::Result<()> {
    let db = database().await?;
    let store = Arc::new(PgStore::new(db.pool.clone()));
    let queue = Arc::new(isolated_queue(&db, 5));

    let job = store.create_job("/tmp/dead.csv", Source::Melli).await?;
    store.begin_processing(job.id).await?;
    store.record_extraction(job.id, &summary(1)).await?;
    store.fail_job(job.id, "chunk transaction failed").await?;

    queue
        .publish(&ChunkMessage {
            job_id: job.id,
            source: Source::Melli,
            chunk_index: 0,
            total_chunks: 1,
            rows: vec![Map::new()],
        })
        .await?;

    let consumer = ChunkConsumer::new(
        store.clone(),
        store.clone(),
        queue.clone(),
        Duration::from_millis(10),
    );
    assert_eq!(consumer.process_next().await?, Some(ChunkOutcome::DeadLettered));
    assert!(queue.receive().await?.is_none());

    let (last_error,): (Option<String>,) = sqlx::query_as(
        "SELECT last_error FROM import_queue WHERE payload LIKE $1 AND dead_lettered_at IS NOT NULL",
    )
    .bind(format!("{{\"job_id\":{},%", job.id))
    .fetch_one(&db.pool)
    .await?;
    assert!(last_error.unwrap_or_default().contains("chunk transaction failed"));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn consumer_commits_chunk_from_postgres_queue() -> anyhow::Result<()> {
    let db = database().await?;
    let store = Arc::new(PgStore::new(db.pool.clone()));
    let queue = Arc::new(isolated_queue(&db, 5));

    let job = store.create_job("/tmp/consumer.csv", Source::Melli).await?;
    store.begin_processing(job.id).await?;
    store.record_extraction(job.id, &summary(1)).await?;

    let national_code = unique_national_code();
    let mut row = Map::new();
    row.insert("NATIONAL_CODE".into(), Value::String(national_code.clone()));
    row.insert("CARD_NO".into(), Value::String(String::new()));
    row.insert("FULL_NAME".into(), Value::String("Queue Person".into()));
    queue
        .publish(&ChunkMessage {
            job_id: job.id,
            source: Source::Melli,
            chunk_index: 0,
            total_chunks: 1,
            rows: vec![row],
        })
        .await?;

    let consumer = ChunkConsumer::new(
        store.clone(),
        store.clone(),
        queue,
        Duration::from_millis(10),
    );
    assert_eq!(consumer.drain().await?, 1);

    let job = store.get_job(job.id).await?.expect("job exists");
    assert_eq!(job.status, ImportJobStatus::Completed);
    assert!(store.find_person(&national_code, Source::Melli).await?.is_some());
    Ok(())
}
