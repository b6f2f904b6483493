use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::storage::db::Database;

pub const EVENT_DOCUMENT_INGESTION_REQUESTED: &str = "document.ingestion_requested";
pub const OUTBOX_DEFAULT_MAX_ATTEMPTS: i32 = 3;
const ENVELOPE_VERSION: u32 = 1;

/// Durable pointer to pending work. `processed_at IS NULL` means the event
/// is still owed; committed rows are retained for audit.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub business_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Payload of `document.ingestion_requested`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IngestionRequested {
    #[serde(rename = "versionId")]
    pub version_id: Uuid,
    #[serde(rename = "jobId")]
    pub job_id: Uuid,
    #[serde(rename = "tenantId")]
    pub tenant_id: Uuid,
}

/// Wraps a payload in the versioned wire envelope.
pub fn envelope(event_type: &str, payload: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "version": ENVELOPE_VERSION,
        "type": event_type,
        "payload": payload,
    })
}

impl OutboxEvent {
    /// Enqueues an event inside the caller's transaction, so the event and
    /// the state change it announces commit or roll back together.
    pub async fn enqueue(
        business_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
        tx: &mut sqlx::PgTransaction<'_>,
    ) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO event_outbox (id, business_id, event_type, payload, max_attempts)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(business_id)
        .bind(event_type)
        .bind(envelope(event_type, payload))
        .bind(OUTBOX_DEFAULT_MAX_ATTEMPTS)
        .execute(&mut **tx)
        .await?;

        Ok(id)
    }

    /// Atomically leases up to `limit` due events for this worker.
    ///
    /// A row is due when it is unprocessed, under its attempt budget, past
    /// its retry window, and not held by a live lease. The lease itself is
    /// the visibility timeout: when a worker crashes, its rows become
    /// pollable again after `lease_secs`. Leasing counts as a delivery
    /// attempt.
    pub async fn lease_batch(
        worker_id: &str,
        lease_secs: i64,
        limit: i64,
        db: &Database,
    ) -> Result<Vec<Self>, AppError> {
        let events = sqlx::query_as::<_, OutboxEvent>(
            "UPDATE event_outbox
             SET leased_by = $1,
                 lease_expires_at = now() + make_interval(secs => $2::double precision),
                 attempts = attempts + 1
             WHERE id IN (
                 SELECT id FROM event_outbox
                 WHERE processed_at IS NULL
                   AND attempts < max_attempts
                   AND (next_retry_at IS NULL OR next_retry_at <= now())
                   AND (lease_expires_at IS NULL OR lease_expires_at <= now())
                 ORDER BY created_at
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING *",
        )
        .bind(worker_id)
        .bind(lease_secs)
        .bind(limit)
        .fetch_all(&db.pool)
        .await?;

        Ok(events)
    }

    /// Commits the event. After this the row is permanently invisible to
    /// pollers; replaying a commit is a no-op.
    pub async fn mark_processed(id: Uuid, db: &Database) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE event_outbox
             SET processed_at = now(), leased_by = NULL, lease_expires_at = NULL
             WHERE id = $1 AND processed_at IS NULL",
        )
        .bind(id)
        .execute(&db.pool)
        .await?;

        Ok(())
    }

    /// Releases the lease and schedules redelivery no earlier than
    /// `next_retry_at`. The attempt was already counted at lease time.
    pub async fn release_for_retry(
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        error: &str,
        db: &Database,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE event_outbox
             SET leased_by = NULL, lease_expires_at = NULL,
                 next_retry_at = $2, last_error = $3
             WHERE id = $1 AND processed_at IS NULL",
        )
        .bind(id)
        .bind(next_retry_at)
        .bind(error)
        .execute(&db.pool)
        .await?;

        Ok(())
    }

    /// Poison rows: unprocessed but out of attempts. Kept for inspection,
    /// never polled again.
    pub async fn poisoned(db: &Database) -> Result<Vec<Self>, AppError> {
        let events = sqlx::query_as::<_, OutboxEvent>(
            "SELECT * FROM event_outbox
             WHERE processed_at IS NULL AND attempts >= max_attempts
             ORDER BY created_at",
        )
        .fetch_all(&db.pool)
        .await?;

        Ok(events)
    }

    pub fn ingestion_payload(&self) -> Result<IngestionRequested, AppError> {
        let payload = self
            .payload
            .get("payload")
            .cloned()
            .ok_or_else(|| AppError::Validation("outbox envelope has no payload field".into()))?;
        Ok(serde_json::from_value(payload)?)
    }
}
