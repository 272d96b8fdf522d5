//! Durable chunk queue.
//!
//! Messages stay in `import_queue` until a consumer acknowledges them. A
//! receive leases one message for a fixed time under a fresh token; if the
//! lease runs out before the ack (worker crash, stall) the message becomes
//! visible again. Rejected messages are retried after a delay until the
//! delivery cap is reached, then parked as dead letters.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::ImportError;
use crate::models::ChunkMessage;

/// A leased message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    /// How many times this message has been handed out, this one included.
    pub deliveries: i32,
    pub lease_token: Uuid,
    pub message: ChunkMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectOutcome {
    /// Will be delivered again after the retry delay.
    Requeued,
    /// Delivery cap reached; the message will not be delivered again.
    DeadLettered,
    /// The lease had already expired; someone else may hold the message.
    LeaseExpired,
}

#[async_trait]
pub trait QueueBroker: Send + Sync {
    async fn publish(&self, message: &ChunkMessage) -> Result<(), ImportError>;

    /// Lease the next visible message, if any.
    async fn receive(&self) -> Result<Option<Delivery>, ImportError>;

    /// Remove a processed message. Returns false if the lease was lost.
    async fn ack(&self, delivery: &Delivery) -> Result<bool, ImportError>;

    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<RejectOutcome, ImportError>;

    /// Park a leased message as a dead letter regardless of its delivery
    /// count. Returns false if the lease was lost.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<bool, ImportError>;
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub queue_name: String,
    pub lease: Duration,
    pub max_deliveries: i32,
    pub retry_delay: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            queue_name: "import_queue".to_string(),
            lease: Duration::from_secs(300),
            max_deliveries: 5,
            retry_delay: Duration::from_secs(30),
        }
    }
}

fn queue_error(e: sqlx::Error) -> ImportError {
    ImportError::QueueConnection(e.to_string())
}

/// Queue backed by the `import_queue` table.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    settings: QueueSettings,
}

impl PgQueue {
    pub fn new(pool: PgPool, settings: QueueSettings) -> Self {
        Self { pool, settings }
    }

    async fn park(&self, id: i64, reason: &str) -> Result<(), ImportError> {
        sqlx::query(
            r#"
            UPDATE import_queue
            SET dead_lettered_at = now(), last_error = $2, leased_until = NULL, lease_token = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;

        tracing::error!(
            "Dead-lettered message {} on queue {}: {}",
            id,
            self.settings.queue_name,
            reason
        );
        Ok(())
    }
}

#[async_trait]
impl QueueBroker for PgQueue {
    async fn publish(&self, message: &ChunkMessage) -> Result<(), ImportError> {
        // Stored as text: column order inside each row is significant.
        let payload = serde_json::to_string(message)
            .map_err(|e| ImportError::InvalidMessage(e.to_string()))?;

        sqlx::query("INSERT INTO import_queue (queue_name, payload) VALUES ($1, $2)")
            .bind(&self.settings.queue_name)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(queue_error)?;

        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, ImportError> {
        loop {
            let lease_token = Uuid::new_v4();
            let claimed: Option<(i64, i32, String)> = sqlx::query_as(
                r#"
                UPDATE import_queue
                SET leased_until = now() + make_interval(secs => $2),
                    lease_token = $3,
                    deliveries = deliveries + 1
                WHERE id = (
                    SELECT id FROM import_queue
                    WHERE queue_name = $1
                      AND dead_lettered_at IS NULL
                      AND available_at <= now()
                      AND (leased_until IS NULL OR leased_until <= now())
                    ORDER BY available_at, id
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
                )
                RETURNING id, deliveries, payload
                "#,
            )
            .bind(&self.settings.queue_name)
            .bind(self.settings.lease.as_secs_f64())
            .bind(lease_token)
            .fetch_optional(&self.pool)
            .await
            .map_err(queue_error)?;

            let Some((id, deliveries, payload)) = claimed else {
                return Ok(None);
            };

            // Leases that expired on every attempt never reach reject().
            if deliveries > self.settings.max_deliveries {
                self.park(id, "delivery limit exceeded without acknowledgement")
                    .await?;
                continue;
            }

            match serde_json::from_str::<ChunkMessage>(&payload) {
                Ok(message) => {
                    return Ok(Some(Delivery {
                        id,
                        deliveries,
                        lease_token,
                        message,
                    }))
                }
                Err(e) => {
                    self.park(id, &format!("unparseable payload: {}", e))
                        .await?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, ImportError> {
        let result = sqlx::query("DELETE FROM import_queue WHERE id = $1 AND lease_token = $2")
            .bind(delivery.id)
            .bind(delivery.lease_token)
            .execute(&self.pool)
            .await
            .map_err(queue_error)?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                "Ack for message {} arrived after its lease expired; it may be redelivered",
                delivery.id
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<RejectOutcome, ImportError> {
        let dead: Option<bool> = sqlx::query_scalar(
            r#"
            UPDATE import_queue
            SET last_error = $3,
                leased_until = NULL,
                lease_token = NULL,
                available_at = now() + make_interval(secs => $4),
                dead_lettered_at = CASE WHEN deliveries >= $5 THEN now() ELSE NULL END
            WHERE id = $1 AND lease_token = $2
            RETURNING dead_lettered_at IS NOT NULL
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.lease_token)
        .bind(reason)
        .bind(self.settings.retry_delay.as_secs_f64())
        .bind(self.settings.max_deliveries)
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_error)?;

        let outcome = match dead {
            None => RejectOutcome::LeaseExpired,
            Some(true) => RejectOutcome::DeadLettered,
            Some(false) => RejectOutcome::Requeued,
        };

        match outcome {
            RejectOutcome::DeadLettered => tracing::error!(
                "Message {} dead-lettered after {} deliveries: {}",
                delivery.id,
                delivery.deliveries,
                reason
            ),
            _ => tracing::warn!(
                "Message {} rejected ({:?}) on delivery {}: {}",
                delivery.id,
                outcome,
                delivery.deliveries,
                reason
            ),
        }

        Ok(outcome)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<bool, ImportError> {
        let result = sqlx::query(
            r#"
            UPDATE import_queue
            SET dead_lettered_at = now(), last_error = $3, leased_until = NULL, lease_token = NULL
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.lease_token)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                "Could not dead-letter message {}: lease already expired",
                delivery.id
            );
            return Ok(false);
        }

        tracing::error!(
            "Dead-lettered message {} on queue {} after {} deliveries: {}",
            delivery.id,
            self.settings.queue_name,
            delivery.deliveries,
            reason
        );
        Ok(true)
    }
}
