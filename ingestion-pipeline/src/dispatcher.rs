//! Outbox dispatcher: polls the durable queue, leases due events, and
//! drives each leased job through the coordinator with bounded
//! concurrency. Leasing is the only cross-process coordination point, so
//! workers scale horizontally.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::error::{AppError, ErrorCode};
use common::storage::db::Database;
use common::storage::types::event_outbox::{OutboxEvent, EVENT_DOCUMENT_INGESTION_REQUESTED};
use common::storage::types::ingestion_job::{IngestionJob, JobEvent, JobStatus, SideEffect};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique identifier for this worker instance, recorded on leases.
    pub worker_id: String,
    /// Concurrent jobs processed by this worker.
    pub concurrency: usize,
    /// Sleep between empty polls.
    pub poll_interval: Duration,
    /// Visibility timeout: a crashed worker's rows reappear after this.
    pub lease_secs: i64,
}

impl WorkerConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: concurrency.max(1),
            poll_interval: Duration::from_secs(2),
            lease_secs: 300,
        }
    }
}

/// Poll-lease-dispatch loop. Runs until the process is stopped.
pub async fn run_worker_loop(
    db: Database,
    pipeline: Arc<crate::pipeline::IngestionPipeline>,
    config: WorkerConfig,
) -> Result<(), AppError> {
    info!(
        worker_id = %config.worker_id,
        concurrency = config.concurrency,
        "worker started, polling outbox"
    );
    let semaphore = Arc::new(Semaphore::new(config.concurrency));

    loop {
        let batch = OutboxEvent::lease_batch(
            &config.worker_id,
            config.lease_secs,
            config.concurrency as i64,
            &db,
        )
        .await;

        match batch {
            Ok(events) if !events.is_empty() => {
                for event in events {
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| AppError::InternalError(format!("worker pool closed: {e}")))?;
                    let db = db.clone();
                    let pipeline = pipeline.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let event_id = event.id;
                        if let Err(e) = handle_event(event, &db, &pipeline).await {
                            error!(event_id = %event_id, error = %e, "event handling failed");
                        }
                    });
                }
            }
            Ok(_) => tokio::time::sleep(config.poll_interval).await,
            Err(e) => {
                error!(error = %e, "outbox poll failed, backing off");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

/// Processes one leased event end to end. Commit semantics: the event is
/// marked processed exactly when the job has reached a terminal state or
/// was found already terminal (replay no-op); a scheduled retry releases
/// the lease with the job's backoff instead.
#[tracing::instrument(skip_all, fields(event_id = %event.id, attempt = event.attempts))]
async fn handle_event(
    event: OutboxEvent,
    db: &Database,
    pipeline: &crate::pipeline::IngestionPipeline,
) -> Result<(), AppError> {
    if event.event_type != EVENT_DOCUMENT_INGESTION_REQUESTED {
        warn!(event_type = %event.event_type, "unknown event type, committing without action");
        return OutboxEvent::mark_processed(event.id, db).await;
    }
    if event.attempts > 1 {
        info!(attempts = event.attempts, "redelivery after expired lease or retry");
    }

    let payload = match event.ingestion_payload() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "undecodable payload");
            return OutboxEvent::release_for_retry(event.id, Utc::now(), &e.to_string(), db).await;
        }
    };

    let job = match IngestionJob::get(payload.job_id, db).await {
        Ok(job) => job,
        Err(AppError::NotFound(what)) => {
            warn!(%what, "job vanished, committing event");
            return OutboxEvent::mark_processed(event.id, db).await;
        }
        Err(e) => return Err(e),
    };

    // Replaying an already-committed event is a no-op.
    if job.status.is_terminal() {
        return OutboxEvent::mark_processed(event.id, db).await;
    }

    // Not due yet: hand the row back without burning work.
    if let (JobStatus::RetryReady, Some(retry_at)) = (job.status, job.next_retry_at) {
        if retry_at > Utc::now() {
            return OutboxEvent::release_for_retry(event.id, retry_at, "retry window not reached", db)
                .await;
        }
    }

    let leased = job.apply(JobEvent::Lease, Utc::now())?;
    IngestionJob::persist(&leased.job, &db.pool).await?;

    match pipeline.run(leased.job).await {
        Ok(done) => {
            info!(job_id = %done.id, attempts = done.attempts, "job done");
            OutboxEvent::mark_processed(event.id, db).await
        }
        Err(err) => {
            let code = err.code();
            let message = err.to_string();
            // The run may have advanced and persisted the stage before
            // failing; transition from the current row, not the stale one.
            let current = IngestionJob::get(payload.job_id, db).await?;
            let fail_event = if code == ErrorCode::DocumentDeleted {
                JobEvent::DocumentDeleted
            } else {
                JobEvent::Fail {
                    code,
                    message: message.clone(),
                }
            };
            let transition = current.apply(fail_event, Utc::now())?;
            IngestionJob::persist(&transition.job, &db.pool).await?;

            match transition.effect {
                // The job row's next_retry_at and the effect carry the same
                // jittered instant; redelivery is gated on exactly that.
                SideEffect::ScheduleRetry(retry_at) => {
                    warn!(
                        job_id = %transition.job.id,
                        attempt = transition.job.attempts,
                        error_code = %code,
                        retry_at = %retry_at,
                        "job failed, retry scheduled"
                    );
                    OutboxEvent::release_for_retry(event.id, retry_at, &message, db).await
                }
                SideEffect::None => {
                    warn!(
                        job_id = %transition.job.id,
                        attempt = transition.job.attempts,
                        error_code = %code,
                        "job failed terminally"
                    );
                    OutboxEvent::mark_processed(event.id, db).await
                }
            }
        }
    }
}
