//! End-to-end pipeline tests on the in-memory store and queue.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tempfile::NamedTempFile;

use people_import::consumer::{ChunkConsumer, ChunkOutcome};
use people_import::db_storage::{EntityStore, JobStore};
use people_import::errors::ImportError;
use people_import::extractor::RowExtractor;
use people_import::memory::{MemoryBroker, MemoryStore};
use people_import::models::{ImportJobStatus, Source};
use people_import::orchestrator::{ChunkOrchestrator, ImportDispatcher, OrchestrationOutcome};
use people_import::queue::QueueBroker;

const HEADER: &str = "NATIONAL_CODE,CARD_NO,FULL_NAME,BIRTH_DATE,MOBILE\n";

struct Pipeline {
    store: MemoryStore,
    broker: MemoryBroker,
    orchestrator: Arc<ChunkOrchestrator>,
}

impl Pipeline {
    fn new() -> Self {
        let store = MemoryStore::new();
        let broker = MemoryBroker::default();
        let orchestrator = Arc::new(ChunkOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(broker.clone()),
            RowExtractor::default(),
        ));
        Self {
            store,
            broker,
            orchestrator,
        }
    }

    fn consumer(&self) -> ChunkConsumer {
        ChunkConsumer::new(
            Arc::new(self.store.clone()),
            Arc::new(self.store.clone()),
            Arc::new(self.broker.clone()),
            Duration::from_millis(10),
        )
    }

    async fn import(&self, file: &NamedTempFile, source: Source) -> (i64, Result<OrchestrationOutcome, ImportError>) {
        let path = file.path().to_string_lossy().to_string();
        let job = self.store.create_job(&path, source).await.unwrap();
        let outcome = self.orchestrator.orchestrate(&job).await;
        (job.id, outcome)
    }
}

fn write_file(suffix: &str, contents: &[u8]) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents).unwrap();
    file.flush().unwrap();
    file
}

fn numbered_rows(count: usize) -> String {
    let mut contents = String::from(HEADER);
    for i in 0..count {
        contents.push_str(&format!("{:010},,Person {},,\n", i + 1, i));
    }
    contents
}

#[tokio::test]
async fn melli_file_is_normalized_and_completed() {
    let pipeline = Pipeline::new();
    let csv = format!(
        "{}{}{}{}",
        HEADER,
        "0012345678,6.03799E+15,Ali Rezaei,1990/05/01,9123456789|09351112233\n",
        "123456789012,6037991234567890,Too Long,,\n",
        "0098765432,6037-9912-3456-7890,Ø¹Ù„ÛŒ Ø±Ø¶Ø§ÛŒÛŒ,1369/02/30,\n",
    );
    let file = write_file(".csv", csv.as_bytes());

    let (job_id, outcome) = pipeline.import(&file, Source::Melli).await;
    assert_eq!(
        outcome.unwrap(),
        OrchestrationOutcome::Published {
            total_chunks: 1,
            total_rows: 3
        }
    );

    let job = pipeline.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImportJobStatus::Processing);
    assert_eq!(job.total_chunks, 1);
    assert_eq!(job.detected_encoding.as_deref(), Some("UTF-8"));
    assert_eq!(job.header_detected, Some(true));
    assert_eq!(job.file_sha256.as_ref().map(String::len), Some(64));

    assert_eq!(pipeline.consumer().drain().await.unwrap(), 1);

    let job = pipeline.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImportJobStatus::Completed);
    assert_eq!(job.processed_chunks, 1);
    assert_eq!(job.skipped_rows, 1);
    assert_eq!(job.completion_percentage(), 100.0);

    let ali = pipeline
        .store
        .find_person("0012345678", Source::Melli)
        .await
        .unwrap()
        .expect("first row stored");
    assert_eq!(ali.first_name, "Ali Rezaei");
    assert_eq!(ali.last_name, None);
    assert_eq!(ali.birthdate, NaiveDate::from_ymd_opt(1990, 5, 1));

    let cards = pipeline.store.credit_cards_for(ali.id).await.unwrap();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].card_number, "6037990000000000");

    let phones: Vec<String> = pipeline
        .store
        .phone_numbers_for(ali.id)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.number)
        .collect();
    assert_eq!(phones, vec!["09123456789", "09351112233"]);

    let repaired = pipeline
        .store
        .find_person("0098765432", Source::Melli)
        .await
        .unwrap()
        .expect("mojibake row stored");
    assert_eq!(repaired.first_name, "علی رضایی");
    assert_eq!(repaired.birthdate, None);

    assert!(pipeline
        .store
        .find_person("123456789012", Source::Melli)
        .await
        .unwrap()
        .is_none());
    assert_eq!(pipeline.store.person_count(), 2);
}

#[tokio::test]
async fn workbook_import_is_normalized_and_completed() {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let date = rust_xlsxwriter::Format::new().set_num_format("yyyy-mm-dd");
    let sheet = workbook.add_worksheet();
    for (col, name) in HEADER.trim_end().split(',').enumerate() {
        sheet.write_string(0, col as u16, name).unwrap();
    }
    // Numeric cells, as spreadsheet tools store long digit strings.
    sheet.write_number(1, 0, 1234567890.0).unwrap();
    sheet.write_number(1, 1, 6037990000000000.0).unwrap();
    sheet.write_string(1, 2, "علی").unwrap();
    sheet.write_number_with_format(1, 3, 32994.0, &date).unwrap();
    sheet.write_number(1, 4, 9123456789.0).unwrap();
    sheet.write_number(2, 0, 12345.0).unwrap();
    let file = write_file(".xlsx", &workbook.save_to_buffer().unwrap());

    let pipeline = Pipeline::new();
    let (job_id, outcome) = pipeline.import(&file, Source::Saderat).await;
    assert_eq!(
        outcome.unwrap(),
        OrchestrationOutcome::Published {
            total_chunks: 1,
            total_rows: 2
        }
    );
    assert_eq!(pipeline.consumer().drain().await.unwrap(), 1);

    let job = pipeline.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImportJobStatus::Completed);
    assert_eq!(job.detected_encoding.as_deref(), Some("xlsx"));
    assert_eq!(job.header_detected, Some(true));
    assert_eq!(job.skipped_rows, 1);

    let person = pipeline
        .store
        .find_person("1234567890", Source::Saderat)
        .await
        .unwrap()
        .expect("workbook row stored");
    assert_eq!(person.first_name, "علی");
    assert_eq!(person.birthdate, NaiveDate::from_ymd_opt(1990, 5, 1));

    let cards = pipeline.store.credit_cards_for(person.id).await.unwrap();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].card_number, "6037990000000000");

    let phones = pipeline.store.phone_numbers_for(person.id).await.unwrap();
    assert_eq!(phones.len(), 1);
    assert_eq!(phones[0].number, "09123456789");
    assert_eq!(pipeline.store.person_count(), 1);
}

#[tokio::test]
async fn chunks_processed_by_two_workers_complete_once() {
    let pipeline = Pipeline::new();
    let file = write_file(".csv", numbered_rows(2_500).as_bytes());

    let (job_id, outcome) = pipeline.import(&file, Source::Saderat).await;
    assert_eq!(
        outcome.unwrap(),
        OrchestrationOutcome::Published {
            total_chunks: 3,
            total_rows: 2_500
        }
    );
    assert_eq!(pipeline.broker.len(), 3);

    let (first, second) = (pipeline.consumer(), pipeline.consumer());
    let (a, b) = tokio::join!(first.drain(), second.drain());
    assert_eq!(a.unwrap() + b.unwrap(), 3);

    let job = pipeline.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImportJobStatus::Completed);
    assert_eq!(job.processed_chunks, 3);
    assert_eq!(pipeline.store.person_count(), 2_500);
}

#[tokio::test]
async fn redelivered_chunk_does_not_double_count() {
    let pipeline = Pipeline::new();
    let file = write_file(".csv", numbered_rows(1_500).as_bytes());
    let (job_id, _) = pipeline.import(&file, Source::Mellat).await;

    // Same chunk delivered twice, as after a crash between commit and ack.
    let first_chunk = pipeline.broker.queued_messages().remove(0);
    pipeline.broker.publish(&first_chunk).await.unwrap();

    let consumer = pipeline.consumer();
    let first = consumer.process_next().await.unwrap();
    assert!(first.is_some());
    let job = pipeline.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.processed_chunks, 1);
    assert_eq!(job.status, ImportJobStatus::Processing);

    assert_eq!(consumer.drain().await.unwrap(), 2);

    let job = pipeline.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.processed_chunks, 2);
    assert_eq!(job.status, ImportJobStatus::Completed);
    assert_eq!(pipeline.store.person_count(), 1_500);
    assert!(pipeline.broker.is_empty());
}

#[tokio::test]
async fn expired_lease_redelivers_without_duplicates() {
    let pipeline = Pipeline::new();
    let file = write_file(".csv", numbered_rows(10).as_bytes());
    let (job_id, _) = pipeline.import(&file, Source::Melli).await;

    // A worker leases the chunk and dies before acknowledging it.
    let abandoned = pipeline.broker.receive().await.unwrap().unwrap();
    pipeline.broker.expire_leases();

    assert_eq!(pipeline.consumer().drain().await.unwrap(), 1);
    assert!(!pipeline.broker.ack(&abandoned).await.unwrap());

    let job = pipeline.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImportJobStatus::Completed);
    assert_eq!(pipeline.store.person_count(), 10);
}

#[tokio::test]
async fn failed_job_is_never_revived_by_late_chunks() {
    let pipeline = Pipeline::new();
    let file = write_file(".csv", numbered_rows(1_200).as_bytes());
    let (job_id, _) = pipeline.import(&file, Source::Melli).await;

    assert!(pipeline
        .store
        .fail_job(job_id, "operator cancelled")
        .await
        .unwrap());
    assert_eq!(pipeline.consumer().drain().await.unwrap(), 2);

    let job = pipeline.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImportJobStatus::Failed);
    assert_eq!(job.processed_chunks, 0);
    assert_eq!(job.error_message.as_deref(), Some("operator cancelled"));
    assert_eq!(pipeline.store.person_count(), 0);
    assert!(pipeline.broker.is_empty());
    assert_eq!(pipeline.broker.dead_letters().len(), 2);
}

#[tokio::test]
async fn failed_chunk_is_dead_lettered_on_redelivery() {
    let pipeline = Pipeline::new();
    let file = write_file(".csv", numbered_rows(1_200).as_bytes());
    let (job_id, _) = pipeline.import(&file, Source::Melli).await;
    pipeline.store.fail_next_chunks(1);

    let consumer = pipeline.consumer();
    let first = consumer.process_next().await;
    assert!(matches!(first, Err(ImportError::Transaction(_))));
    assert_eq!(pipeline.broker.len(), 2);
    assert!(pipeline.broker.dead_letters().is_empty());

    // The rejected chunk comes back first, then the untouched one.
    let redelivery = consumer.process_next().await.unwrap();
    assert_eq!(redelivery, Some(ChunkOutcome::DeadLettered));
    assert_eq!(consumer.drain().await.unwrap(), 1);

    assert!(pipeline.broker.is_empty());
    let dead = pipeline.broker.dead_letters();
    assert_eq!(dead.len(), 2);
    assert!(dead
        .iter()
        .all(|reason| reason.starts_with(&format!("import job {} failed", job_id))));

    let job = pipeline.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImportJobStatus::Failed);
    assert_eq!(job.processed_chunks, 0);
    assert_eq!(pipeline.store.person_count(), 0);
}

#[tokio::test]
async fn unsupported_format_fails_job_without_chunks() {
    let pipeline = Pipeline::new();
    let file = write_file(".pdf", b"%PDF-1.4");

    let (job_id, outcome) = pipeline.import(&file, Source::Melli).await;
    assert!(matches!(outcome, Err(ImportError::UnsupportedFormat(_))));

    let job = pipeline.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImportJobStatus::Failed);
    assert!(job
        .error_message
        .unwrap_or_default()
        .contains("unsupported file format"));
    assert!(pipeline.broker.is_empty());
}

#[tokio::test]
async fn missing_file_fails_job() {
    let pipeline = Pipeline::new();
    let job = pipeline
        .store
        .create_job("/nonexistent/people.csv", Source::Unknown)
        .await
        .unwrap();

    let outcome = pipeline.orchestrator.orchestrate(&job).await;
    assert!(matches!(outcome, Err(ImportError::FileRead { .. })));
    let job = pipeline.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, ImportJobStatus::Failed);
}

#[tokio::test]
async fn header_only_file_completes_immediately() {
    let pipeline = Pipeline::new();
    let file = write_file(".csv", HEADER.as_bytes());

    let (job_id, outcome) = pipeline.import(&file, Source::Melli).await;
    assert_eq!(
        outcome.unwrap(),
        OrchestrationOutcome::Published {
            total_chunks: 0,
            total_rows: 0
        }
    );

    let job = pipeline.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImportJobStatus::Completed);
    assert_eq!(job.total_chunks, 0);
    assert_eq!(job.completion_percentage(), 100.0);
    assert!(pipeline.broker.is_empty());
}

#[tokio::test]
async fn publish_failure_fails_job() {
    let pipeline = Pipeline::new();
    pipeline.broker.fail_publishes(Some("connection refused"));
    let file = write_file(".csv", numbered_rows(5).as_bytes());

    let (job_id, outcome) = pipeline.import(&file, Source::Melli).await;
    assert!(matches!(outcome, Err(ImportError::QueueConnection(_))));

    let job = pipeline.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImportJobStatus::Failed);
    assert_eq!(job.total_chunks, 1);
}

#[tokio::test]
async fn reimporting_a_file_updates_instead_of_duplicating() {
    let pipeline = Pipeline::new();
    let first = write_file(
        ".csv",
        format!("{}0012345678,6037991234567890,Old Name,,9123456789\n", HEADER).as_bytes(),
    );
    let second = write_file(
        ".csv",
        format!("{}0012345678,6037991234567890,New Name,1990-01-01,09123456789\n", HEADER)
            .as_bytes(),
    );

    pipeline.import(&first, Source::Melli).await.1.unwrap();
    pipeline.consumer().drain().await.unwrap();
    pipeline.import(&second, Source::Melli).await.1.unwrap();
    pipeline.consumer().drain().await.unwrap();

    assert_eq!(pipeline.store.person_count(), 1);
    assert_eq!(pipeline.store.credit_card_count(), 1);
    assert_eq!(pipeline.store.phone_number_count(), 1);

    let person = pipeline
        .store
        .find_person("0012345678", Source::Melli)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(person.first_name, "New Name");
    assert_eq!(person.birthdate, NaiveDate::from_ymd_opt(1990, 1, 1));

    // Same national code under another source is a different person.
    let other = write_file(
        ".csv",
        format!("{}0012345678,,Other Bank,,\n", HEADER).as_bytes(),
    );
    pipeline.import(&other, Source::Saderat).await.1.unwrap();
    pipeline.consumer().drain().await.unwrap();
    assert_eq!(pipeline.store.person_count(), 2);
}

#[tokio::test]
async fn headerless_file_keeps_first_row_as_data() {
    let pipeline = Pipeline::new();
    let file = write_file(
        ".txt",
        b"0012345678,6037991234567890,First,,\n0023456789,,Second,,\n",
    );

    let (job_id, outcome) = pipeline.import(&file, Source::Melli).await;
    assert_eq!(
        outcome.unwrap(),
        OrchestrationOutcome::Published {
            total_chunks: 1,
            total_rows: 2
        }
    );
    pipeline.consumer().drain().await.unwrap();

    let job = pipeline.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.header_detected, Some(false));
    assert_eq!(pipeline.store.person_count(), 2);
}

#[tokio::test]
async fn phone_numbers_can_be_replaced_for_one_source() {
    let pipeline = Pipeline::new();
    let file = write_file(
        ".csv",
        format!("{}0012345678,,Name,,9123456789|9351112233\n", HEADER).as_bytes(),
    );
    pipeline.import(&file, Source::Melli).await.1.unwrap();
    pipeline.consumer().drain().await.unwrap();

    let person = pipeline
        .store
        .find_person("0012345678", Source::Melli)
        .await
        .unwrap()
        .unwrap();

    let replaced = pipeline
        .store
        .replace_phone_numbers(
            person.id,
            Source::Melli,
            &["0912 000 1111".to_string(), "9120001111".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(replaced.len(), 1);
    assert_eq!(replaced[0].number, "09120001111");

    let stored = pipeline.store.phone_numbers_for(person.id).await.unwrap();
    assert_eq!(stored, replaced);
}

#[tokio::test]
async fn dispatcher_runs_submitted_and_pending_jobs() {
    let pipeline = Pipeline::new();
    let dispatcher = ImportDispatcher::new(Arc::clone(&pipeline.orchestrator), 2);
    let file = write_file(".csv", numbered_rows(3).as_bytes());
    let path = file.path().to_string_lossy().to_string();

    let submitted = dispatcher.submit(&path, Source::Melli).await.unwrap();
    assert_eq!(submitted.status, ImportJobStatus::Pending);

    // A job left PENDING by a previous process.
    let stranded = pipeline.store.create_job(&path, Source::Mellat).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let remaining = pipeline.store.pending_jobs().await.unwrap();
            if remaining.iter().all(|j| j.id != stranded.id) {
                break;
            }
            let _ = dispatcher.resume_pending().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("pending job picked up");

    tokio::time::timeout(Duration::from_secs(5), async {
        while pipeline.broker.len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both jobs published");

    pipeline.consumer().drain().await.unwrap();
    for id in [submitted.id, stranded.id] {
        let job = pipeline.store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, ImportJobStatus::Completed);
    }
}
