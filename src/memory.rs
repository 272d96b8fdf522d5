//! In-memory store and queue.
//!
//! Both keep their state behind `Arc<RwLock>`/`Arc<Mutex>` so clones share
//! it, and both follow the PostgreSQL implementations' semantics closely
//! enough to drive the whole pipeline in tests without a database.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::db_storage::{normalize_phone_list, ChunkWriteStats, EntityStore, JobStore};
use crate::errors::ImportError;
use crate::models::{
    ChunkMessage, ChunkProgress, CreditCard, ExtractionSummary, ImportJob, ImportJobStatus, Person,
    PhoneNumber, Source,
};
use crate::normalizer::NormalizedRecord;
use crate::queue::{Delivery, QueueBroker, RejectOutcome};

#[derive(Default)]
struct StoreState {
    next_id: i64,
    jobs: BTreeMap<i64, ImportJob>,
    completed_chunks: HashSet<(i64, i32)>,
    persons: Vec<Person>,
    credit_cards: Vec<CreditCard>,
    phone_numbers: Vec<PhoneNumber>,
    /// Number of upcoming `apply_chunk` calls that fail before writing.
    failing_chunks: u32,
}

impl StoreState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn upsert_person(&mut self, source: Source, record: &NormalizedRecord) -> i64 {
        let now = Utc::now();
        if let Some(person) = self
            .persons
            .iter_mut()
            .find(|p| p.national_code == record.national_code && p.source == source)
        {
            person.first_name = record.first_name.clone();
            person.last_name = record.last_name.clone();
            person.birthdate = record.birthdate;
            person.updated_at = now;
            return person.id;
        }

        let id = self.next_id();
        self.persons.push(Person {
            id,
            national_code: record.national_code.clone(),
            source,
            first_name: record.first_name.clone(),
            last_name: record.last_name.clone(),
            birthdate: record.birthdate,
            created_at: now,
            updated_at: now,
        });
        id
    }

    fn upsert_card(&mut self, source: Source, card_number: &str, person_id: i64) {
        if let Some(card) = self
            .credit_cards
            .iter_mut()
            .find(|c| c.card_number == card_number && c.source == source)
        {
            card.person_id = person_id;
            return;
        }
        let id = self.next_id();
        self.credit_cards.push(CreditCard {
            id,
            card_number: card_number.to_string(),
            source,
            person_id,
        });
    }

    fn insert_phone(&mut self, source: Source, number: &str, person_id: i64) {
        let exists = self
            .phone_numbers
            .iter()
            .any(|p| p.number == number && p.person_id == person_id && p.source == source);
        if !exists {
            let id = self.next_id();
            self.phone_numbers.push(PhoneNumber {
                id,
                number: number.to_string(),
                person_id,
                source,
            });
        }
    }
}

/// In-memory [`JobStore`] + [`EntityStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryStore")
            .field("job_count", &state.jobs.len())
            .field("person_count", &state.persons.len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` chunk transactions fail without writing anything.
    #[doc(hidden)]
    pub fn fail_next_chunks(&self, count: u32) {
        self.state.write().failing_chunks = count;
    }

    pub fn person_count(&self) -> usize {
        self.state.read().persons.len()
    }

    pub fn credit_card_count(&self) -> usize {
        self.state.read().credit_cards.len()
    }

    pub fn phone_number_count(&self) -> usize {
        self.state.read().phone_numbers.len()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, file_path: &str, source: Source) -> Result<ImportJob, ImportError> {
        let mut state = self.state.write();
        let now = Utc::now();
        let job = ImportJob {
            id: state.next_id(),
            source,
            file_path: file_path.to_string(),
            status: ImportJobStatus::Pending,
            total_chunks: 0,
            processed_chunks: 0,
            skipped_rows: 0,
            total_rows: None,
            detected_encoding: None,
            header_detected: None,
            file_sha256: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<ImportJob>, ImportError> {
        Ok(self.state.read().jobs.get(&job_id).cloned())
    }

    async fn pending_jobs(&self) -> Result<Vec<ImportJob>, ImportError> {
        Ok(self
            .state
            .read()
            .jobs
            .values()
            .filter(|j| j.status == ImportJobStatus::Pending)
            .cloned()
            .collect())
    }

    async fn begin_processing(&self, job_id: i64) -> Result<bool, ImportError> {
        let mut state = self.state.write();
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == ImportJobStatus::Pending => {
                job.status = ImportJobStatus::Processing;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_extraction(
        &self,
        job_id: i64,
        summary: &ExtractionSummary,
    ) -> Result<Option<ImportJob>, ImportError> {
        let mut state = self.state.write();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != ImportJobStatus::Processing {
            return Ok(None);
        }

        job.total_chunks = summary.total_chunks;
        job.total_rows = Some(summary.total_rows);
        job.detected_encoding = Some(summary.detected_encoding.clone());
        job.header_detected = Some(summary.header_detected);
        job.file_sha256 = Some(summary.file_sha256.clone());
        if summary.total_chunks == 0 {
            job.status = ImportJobStatus::Completed;
        }
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn record_chunk(
        &self,
        job_id: i64,
        chunk_index: i32,
        _rows_total: u32,
        rows_skipped: u32,
    ) -> Result<ChunkProgress, ImportError> {
        let mut state = self.state.write();
        let StoreState {
            jobs,
            completed_chunks,
            ..
        } = &mut *state;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(ImportError::JobNotFound(job_id))?;

        let newly_recorded = (0..job.total_chunks).contains(&chunk_index)
            && completed_chunks.insert((job_id, chunk_index));
        if newly_recorded {
            job.processed_chunks += 1;
            job.skipped_rows += i64::from(rows_skipped);
        }
        if job.status == ImportJobStatus::Processing && job.processed_chunks >= job.total_chunks {
            job.status = ImportJobStatus::Completed;
        }
        job.updated_at = Utc::now();

        Ok(ChunkProgress {
            status: job.status,
            processed_chunks: job.processed_chunks,
            total_chunks: job.total_chunks,
            newly_recorded,
        })
    }

    async fn fail_job(&self, job_id: i64, error_message: &str) -> Result<bool, ImportError> {
        let mut state = self.state.write();
        match state.jobs.get_mut(&job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = ImportJobStatus::Failed;
                job.error_message = Some(error_message.to_string());
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn apply_chunk(
        &self,
        source: Source,
        records: &[NormalizedRecord],
    ) -> Result<ChunkWriteStats, ImportError> {
        let mut state = self.state.write();
        if state.failing_chunks > 0 {
            state.failing_chunks -= 1;
            return Err(ImportError::Transaction(
                "simulated transaction failure".to_string(),
            ));
        }

        let mut stats = ChunkWriteStats::default();
        for record in records {
            let person_id = state.upsert_person(source, record);
            stats.persons += 1;
            if let Some(card_number) = &record.card_number {
                state.upsert_card(source, card_number, person_id);
                stats.credit_cards += 1;
            }
            for number in &record.phone_numbers {
                state.insert_phone(source, number, person_id);
                stats.phone_numbers += 1;
            }
        }
        Ok(stats)
    }

    async fn find_person(
        &self,
        national_code: &str,
        source: Source,
    ) -> Result<Option<Person>, ImportError> {
        Ok(self
            .state
            .read()
            .persons
            .iter()
            .find(|p| p.national_code == national_code && p.source == source)
            .cloned())
    }

    async fn credit_cards_for(&self, person_id: i64) -> Result<Vec<CreditCard>, ImportError> {
        Ok(self
            .state
            .read()
            .credit_cards
            .iter()
            .filter(|c| c.person_id == person_id)
            .cloned()
            .collect())
    }

    async fn phone_numbers_for(&self, person_id: i64) -> Result<Vec<PhoneNumber>, ImportError> {
        Ok(self
            .state
            .read()
            .phone_numbers
            .iter()
            .filter(|p| p.person_id == person_id)
            .cloned()
            .collect())
    }

    async fn replace_phone_numbers(
        &self,
        person_id: i64,
        source: Source,
        numbers: &[String],
    ) -> Result<Vec<PhoneNumber>, ImportError> {
        let numbers = normalize_phone_list(numbers);
        let mut state = self.state.write();
        state
            .phone_numbers
            .retain(|p| !(p.person_id == person_id && p.source == source));
        for number in &numbers {
            state.insert_phone(source, number, person_id);
        }
        Ok(state
            .phone_numbers
            .iter()
            .filter(|p| p.person_id == person_id && p.source == source)
            .cloned()
            .collect())
    }
}

struct QueuedMessage {
    id: i64,
    payload: String,
    deliveries: i32,
    lease_token: Option<Uuid>,
    dead_letter: Option<String>,
}

#[derive(Default)]
struct BrokerState {
    next_id: i64,
    messages: Vec<QueuedMessage>,
    publish_failure: Option<String>,
}

/// In-memory [`QueueBroker`].
///
/// Leases never time out on their own; call [`MemoryBroker::expire_leases`]
/// to simulate a consumer that died holding messages. Retry delays are not
/// modelled: a rejected message is visible again immediately.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    max_deliveries: i32,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(5)
    }
}

impl MemoryBroker {
    pub fn new(max_deliveries: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            max_deliveries,
        }
    }

    /// Make every subsequent publish fail with `reason` (or succeed again with `None`).
    #[doc(hidden)]
    pub fn fail_publishes(&self, reason: Option<&str>) {
        self.state.lock().publish_failure = reason.map(str::to_string);
    }

    /// Drop every outstanding lease.
    #[doc(hidden)]
    pub fn expire_leases(&self) {
        for message in self.state.lock().messages.iter_mut() {
            message.lease_token = None;
        }
    }

    /// Messages still deliverable or in flight, in publish order.
    pub fn queued_messages(&self) -> Vec<ChunkMessage> {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.dead_letter.is_none())
            .filter_map(|m| serde_json::from_str(&m.payload).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.dead_letter.is_none())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reasons recorded for dead-lettered messages.
    pub fn dead_letters(&self) -> Vec<String> {
        self.state
            .lock()
            .messages
            .iter()
            .filter_map(|m| m.dead_letter.clone())
            .collect()
    }

    /// Enqueue a raw payload, bypassing serialization.
    #[doc(hidden)]
    pub fn publish_raw(&self, payload: &str) {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.messages.push(QueuedMessage {
            id,
            payload: payload.to_string(),
            deliveries: 0,
            lease_token: None,
            dead_letter: None,
        });
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn publish(&self, message: &ChunkMessage) -> Result<(), ImportError> {
        if let Some(reason) = self.state.lock().publish_failure.clone() {
            return Err(ImportError::QueueConnection(reason));
        }
        let payload = serde_json::to_string(message)
            .map_err(|e| ImportError::InvalidMessage(e.to_string()))?;
        self.publish_raw(&payload);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, ImportError> {
        let mut state = self.state.lock();
        for queued in state.messages.iter_mut() {
            if queued.dead_letter.is_some() || queued.lease_token.is_some() {
                continue;
            }

            queued.deliveries += 1;
            if queued.deliveries > self.max_deliveries {
                queued.dead_letter =
                    Some("delivery limit exceeded without acknowledgement".to_string());
                continue;
            }

            match serde_json::from_str::<ChunkMessage>(&queued.payload) {
                Ok(message) => {
                    let lease_token = Uuid::new_v4();
                    queued.lease_token = Some(lease_token);
                    return Ok(Some(Delivery {
                        id: queued.id,
                        deliveries: queued.deliveries,
                        lease_token,
                        message,
                    }));
                }
                Err(e) => {
                    queued.dead_letter = Some(format!("unparseable payload: {}", e));
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, ImportError> {
        let mut state = self.state.lock();
        let before = state.messages.len();
        state
            .messages
            .retain(|m| !(m.id == delivery.id && m.lease_token == Some(delivery.lease_token)));
        Ok(state.messages.len() < before)
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<RejectOutcome, ImportError> {
        let mut state = self.state.lock();
        let Some(queued) = state
            .messages
            .iter_mut()
            .find(|m| m.id == delivery.id && m.lease_token == Some(delivery.lease_token))
        else {
            return Ok(RejectOutcome::LeaseExpired);
        };

        queued.lease_token = None;
        if queued.deliveries >= self.max_deliveries {
            queued.dead_letter = Some(reason.to_string());
            Ok(RejectOutcome::DeadLettered)
        } else {
            Ok(RejectOutcome::Requeued)
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<bool, ImportError> {
        let mut state = self.state.lock();
        let Some(queued) = state
            .messages
            .iter_mut()
            .find(|m| m.id == delivery.id && m.lease_token == Some(delivery.lease_token))
        else {
            return Ok(false);
        };

        queued.lease_token = None;
        queued.dead_letter = Some(reason.to_string());
        Ok(true)
    }
}
