use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::error::{AppError, ErrorCode};
use crate::storage::db::Database;
use crate::storage::types::source_type::SourceType;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Exponential backoff base and cap for retry scheduling.
const RETRY_BASE_DELAY_SECS: u64 = 30;
const RETRY_MAX_DELAY_SECS: u64 = 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    RetryReady,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Sub-status refining `queued`/`processing`/`retry_ready`; a retried job
/// resumes at the stage it failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "job_stage", rename_all = "snake_case")]
pub enum JobStage {
    PendingUpload,
    Uploaded,
    Parsing,
    Chunking,
    Embedding,
}

/// Events fed to the state machine. Persistence happens separately; the
/// machine itself is a pure function over (row, event).
#[derive(Debug, Clone)]
pub enum JobEvent {
    UploadComplete,
    Lease,
    AdvanceStage(JobStage),
    Complete { metrics: serde_json::Value },
    Fail { code: ErrorCode, message: String },
    DocumentDeleted,
    Cancel,
}

impl JobEvent {
    fn name(&self) -> &'static str {
        match self {
            JobEvent::UploadComplete => "upload_complete",
            JobEvent::Lease => "lease",
            JobEvent::AdvanceStage(_) => "advance_stage",
            JobEvent::Complete { .. } => "complete",
            JobEvent::Fail { .. } => "fail",
            JobEvent::DocumentDeleted => "document_deleted",
            JobEvent::Cancel => "cancel",
        }
    }
}

/// Side effect the caller owes after persisting a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    None,
    /// Reschedule delivery no earlier than the contained instant.
    ScheduleRetry(DateTime<Utc>),
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub job: IngestionJob,
    pub effect: SideEffect,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid job transition: {status:?}/{stage:?} does not accept {event}")]
pub struct InvalidTransition {
    pub status: JobStatus,
    pub stage: JobStage,
    pub event: &'static str,
}

impl From<InvalidTransition> for AppError {
    fn from(err: InvalidTransition) -> Self {
        AppError::InternalError(err.to_string())
    }
}

/// The unit advanced by the state machine: one ingestion attempt series for
/// one document version.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct IngestionJob {
    pub id: Uuid,
    pub business_id: Uuid,
    pub version_id: Uuid,
    pub source_type: SourceType,
    pub status: JobStatus,
    pub stage: JobStage,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub error_code: Option<String>,
    pub metrics: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deterministic exponential backoff: `base × 2^(attempts-1)`, capped.
pub fn backoff_delay(attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 10) as u32;
    let delay = RETRY_BASE_DELAY_SECS.saturating_mul(2u64.saturating_pow(exponent));
    Duration::from_secs(delay.min(RETRY_MAX_DELAY_SECS))
}

/// Adds up to 10% random jitter so recovering providers are not hit by a
/// thundering herd of synchronized retries.
pub fn jittered(delay: Duration) -> Duration {
    let jitter_ceiling = (delay.as_millis() as u64 / 10).max(1);
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ceiling))
}

impl IngestionJob {
    /// Transition function over (current row, event). Returns the next row
    /// state plus the side effect the caller must honour after persisting
    /// it. Retry scheduling draws a jittered backoff, so the persisted
    /// `next_retry_at` and the returned effect carry the same instant.
    pub fn apply(&self, event: JobEvent, now: DateTime<Utc>) -> Result<Transition, InvalidTransition> {
        let invalid = |event: &JobEvent| InvalidTransition {
            status: self.status,
            stage: self.stage,
            event: event.name(),
        };

        let mut next = self.clone();
        next.updated_at = now;

        let effect = match &event {
            JobEvent::UploadComplete => {
                if self.status != JobStatus::Queued || self.stage != JobStage::PendingUpload {
                    return Err(invalid(&event));
                }
                next.stage = JobStage::Uploaded;
                SideEffect::None
            }
            JobEvent::Lease => {
                match (self.status, self.stage) {
                    (JobStatus::Queued, JobStage::Uploaded) => {
                        next.stage = JobStage::Parsing;
                    }
                    // Retry window reached: resume at the recorded stage.
                    (JobStatus::RetryReady, _) => {}
                    _ => return Err(invalid(&event)),
                }
                next.status = JobStatus::Processing;
                next.attempts = self.attempts + 1;
                next.started_at = self.started_at.or(Some(now));
                next.next_retry_at = None;
                SideEffect::None
            }
            JobEvent::AdvanceStage(stage) => {
                let allowed = self.status == JobStatus::Processing
                    && matches!(
                        (self.stage, stage),
                        (JobStage::Parsing, JobStage::Chunking)
                            | (JobStage::Chunking, JobStage::Embedding)
                    );
                if !allowed {
                    return Err(invalid(&event));
                }
                next.stage = *stage;
                SideEffect::None
            }
            JobEvent::Complete { metrics } => {
                if self.status != JobStatus::Processing || self.stage != JobStage::Embedding {
                    return Err(invalid(&event));
                }
                next.status = JobStatus::Done;
                next.completed_at = Some(now);
                next.metrics = Some(metrics.clone());
                next.last_error = None;
                next.error_code = None;
                SideEffect::None
            }
            JobEvent::Fail { code, message } => {
                if self.status != JobStatus::Processing {
                    return Err(invalid(&event));
                }
                next.last_error = Some(message.clone());
                next.error_code = Some(code.as_str().to_string());
                if code.is_retryable() && self.attempts < self.max_attempts {
                    let retry_at = now
                        + chrono::Duration::from_std(jittered(backoff_delay(self.attempts)))
                            .unwrap_or_else(|_| chrono::Duration::seconds(RETRY_BASE_DELAY_SECS as i64));
                    next.status = JobStatus::RetryReady;
                    next.next_retry_at = Some(retry_at);
                    SideEffect::ScheduleRetry(retry_at)
                } else {
                    next.status = JobStatus::Failed;
                    next.completed_at = Some(now);
                    SideEffect::None
                }
            }
            JobEvent::DocumentDeleted => {
                if self.status.is_terminal() {
                    return Err(invalid(&event));
                }
                next.status = JobStatus::Failed;
                next.completed_at = Some(now);
                next.error_code = Some(ErrorCode::DocumentDeleted.as_str().to_string());
                next.last_error = Some("document was deleted".to_string());
                SideEffect::None
            }
            JobEvent::Cancel => {
                if self.status.is_terminal() {
                    return Err(invalid(&event));
                }
                next.status = JobStatus::Cancelled;
                next.completed_at = Some(now);
                SideEffect::None
            }
        };

        Ok(Transition { job: next, effect })
    }

    pub async fn create(
        business_id: Uuid,
        version_id: Uuid,
        source_type: SourceType,
        tx: &mut sqlx::PgTransaction<'_>,
    ) -> Result<Self, AppError> {
        let job = sqlx::query_as::<_, IngestionJob>(
            "INSERT INTO ingestion_job (id, business_id, version_id, source_type, max_attempts)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(business_id)
        .bind(version_id)
        .bind(source_type)
        .bind(DEFAULT_MAX_ATTEMPTS)
        .fetch_one(&mut **tx)
        .await?;

        Ok(job)
    }

    pub async fn get(id: Uuid, db: &Database) -> Result<Self, AppError> {
        sqlx::query_as::<_, IngestionJob>("SELECT * FROM ingestion_job WHERE id = $1")
            .bind(id)
            .fetch_optional(&db.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("ingestion job {id}")))
    }

    /// The active (non-terminal) job for a version, if any. At most one
    /// exists per version at a time; older terminal jobs are kept for audit.
    pub async fn active_for_version(
        version_id: Uuid,
        db: &Database,
    ) -> Result<Option<Self>, AppError> {
        let job = sqlx::query_as::<_, IngestionJob>(
            "SELECT * FROM ingestion_job
             WHERE version_id = $1 AND status IN ('queued', 'processing', 'retry_ready')
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(version_id)
        .fetch_optional(&db.pool)
        .await?;

        Ok(job)
    }

    pub async fn non_terminal_for_document(
        document_id: Uuid,
        tx: &mut sqlx::PgTransaction<'_>,
    ) -> Result<Vec<Self>, AppError> {
        let jobs = sqlx::query_as::<_, IngestionJob>(
            "SELECT j.* FROM ingestion_job j
             JOIN document_version v ON v.id = j.version_id
             WHERE v.document_id = $1 AND j.status IN ('queued', 'processing', 'retry_ready')",
        )
        .bind(document_id)
        .fetch_all(&mut **tx)
        .await?;

        Ok(jobs)
    }

    /// Writes a transitioned row back. The state machine owns what changed;
    /// this persists every mutable column in one statement.
    pub async fn persist<'e, E>(job: &IngestionJob, executor: E) -> Result<(), AppError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            "UPDATE ingestion_job
             SET status = $2, stage = $3, attempts = $4, last_error = $5, error_code = $6,
                 metrics = $7, started_at = $8, completed_at = $9, next_retry_at = $10,
                 updated_at = $11
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(job.status)
        .bind(job.stage)
        .bind(job.attempts)
        .bind(&job.last_error)
        .bind(&job.error_code)
        .bind(&job.metrics)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.next_retry_at)
        .bind(job.updated_at)
        .execute(executor)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_job() -> IngestionJob {
        let now = Utc::now();
        IngestionJob {
            id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            version_id: Uuid::new_v4(),
            source_type: SourceType::Pdf,
            status: JobStatus::Queued,
            stage: JobStage::PendingUpload,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
            error_code: None,
            metrics: None,
            started_at: None,
            completed_at: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn apply(job: &IngestionJob, event: JobEvent) -> Transition {
        job.apply(event, Utc::now()).expect("valid transition")
    }

    #[test]
    fn happy_path_to_done() {
        let job = queued_job();
        let job = apply(&job, JobEvent::UploadComplete).job;
        assert_eq!((job.status, job.stage), (JobStatus::Queued, JobStage::Uploaded));

        let job = apply(&job, JobEvent::Lease).job;
        assert_eq!((job.status, job.stage), (JobStatus::Processing, JobStage::Parsing));
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());

        let job = apply(&job, JobEvent::AdvanceStage(JobStage::Chunking)).job;
        let job = apply(&job, JobEvent::AdvanceStage(JobStage::Embedding)).job;
        let job = apply(
            &job,
            JobEvent::Complete {
                metrics: serde_json::json!({ "pageCount": 3 }),
            },
        )
        .job;

        assert_eq!(job.status, JobStatus::Done);
        assert!(job.completed_at.is_some());
        assert_eq!(job.metrics.unwrap()["pageCount"], 3);
    }

    #[test]
    fn retryable_failure_schedules_retry_at_same_stage() {
        let job = queued_job();
        let job = apply(&job, JobEvent::UploadComplete).job;
        let job = apply(&job, JobEvent::Lease).job;
        let job = apply(&job, JobEvent::AdvanceStage(JobStage::Chunking)).job;
        let job = apply(&job, JobEvent::AdvanceStage(JobStage::Embedding)).job;

        let transition = apply(
            &job,
            JobEvent::Fail {
                code: ErrorCode::ProviderRateLimited,
                message: "429 Too Many Requests".into(),
            },
        );
        let retried = transition.job;
        assert_eq!(retried.status, JobStatus::RetryReady);
        assert_eq!(retried.stage, JobStage::Embedding);
        assert!(retried.next_retry_at.is_some());
        assert!(matches!(transition.effect, SideEffect::ScheduleRetry(_)));

        // The retry lease resumes at the embedding stage.
        let resumed = apply(&retried, JobEvent::Lease).job;
        assert_eq!((resumed.status, resumed.stage), (JobStatus::Processing, JobStage::Embedding));
        assert_eq!(resumed.attempts, 2);
        assert!(resumed.next_retry_at.is_none());
    }

    #[test]
    fn retryable_failure_at_max_attempts_is_terminal() {
        let mut job = queued_job();
        job.status = JobStatus::Processing;
        job.stage = JobStage::Parsing;
        job.attempts = DEFAULT_MAX_ATTEMPTS;

        let transition = apply(
            &job,
            JobEvent::Fail {
                code: ErrorCode::Timeout,
                message: "stage deadline elapsed".into(),
            },
        );
        assert_eq!(transition.job.status, JobStatus::Failed);
        assert!(transition.job.completed_at.is_some());
        assert_eq!(transition.effect, SideEffect::None);
    }

    #[test]
    fn terminal_error_fails_regardless_of_attempts() {
        let mut job = queued_job();
        job.status = JobStatus::Processing;
        job.stage = JobStage::Parsing;
        job.attempts = 1;

        let transition = apply(
            &job,
            JobEvent::Fail {
                code: ErrorCode::NeedsOcr,
                message: "5 pages, almost no text".into(),
            },
        );
        assert_eq!(transition.job.status, JobStatus::Failed);
        assert_eq!(transition.job.error_code.as_deref(), Some("needs_ocr"));
    }

    #[test]
    fn document_deleted_fails_any_non_terminal_job() {
        for (status, stage) in [
            (JobStatus::Queued, JobStage::PendingUpload),
            (JobStatus::Processing, JobStage::Chunking),
            (JobStatus::RetryReady, JobStage::Embedding),
        ] {
            let mut job = queued_job();
            job.status = status;
            job.stage = stage;
            let next = apply(&job, JobEvent::DocumentDeleted).job;
            assert_eq!(next.status, JobStatus::Failed);
            assert_eq!(next.error_code.as_deref(), Some("document_deleted"));
        }
    }

    #[test]
    fn terminal_jobs_reject_further_events() {
        let mut job = queued_job();
        job.status = JobStatus::Done;
        assert!(job.apply(JobEvent::DocumentDeleted, Utc::now()).is_err());
        assert!(job.apply(JobEvent::Lease, Utc::now()).is_err());
        assert!(job.apply(JobEvent::Cancel, Utc::now()).is_err());
        assert!(job
            .apply(
                JobEvent::Fail {
                    code: ErrorCode::Internal,
                    message: "late".into()
                },
                Utc::now()
            )
            .is_err());
    }

    #[test]
    fn cancel_ends_any_non_terminal_job() {
        for (status, stage) in [
            (JobStatus::Queued, JobStage::PendingUpload),
            (JobStatus::Processing, JobStage::Embedding),
            (JobStatus::RetryReady, JobStage::Parsing),
        ] {
            let mut job = queued_job();
            job.status = status;
            job.stage = stage;
            let transition = apply(&job, JobEvent::Cancel);
            assert_eq!(transition.job.status, JobStatus::Cancelled);
            assert!(transition.job.completed_at.is_some());
            assert_eq!(transition.effect, SideEffect::None);
        }
    }

    #[test]
    fn retry_instant_is_jittered_and_shared_with_the_effect() {
        let mut job = queued_job();
        job.status = JobStatus::Processing;
        job.stage = JobStage::Parsing;
        job.attempts = 2;

        let now = Utc::now();
        let transition = job
            .apply(
                JobEvent::Fail {
                    code: ErrorCode::Timeout,
                    message: "t".into(),
                },
                now,
            )
            .expect("valid transition");

        let retry_at = transition.job.next_retry_at.expect("retry scheduled");
        let delay = (retry_at - now).to_std().expect("future instant");
        // Second retry: 60s base plus up to 10% jitter.
        assert!(delay >= Duration::from_secs(60), "delay was {delay:?}");
        assert!(delay <= Duration::from_secs(67), "delay was {delay:?}");
        assert_eq!(
            transition.effect,
            SideEffect::ScheduleRetry(retry_at),
            "the effect carries the instant persisted on the row"
        );
    }

    #[test]
    fn stage_skips_are_rejected() {
        let mut job = queued_job();
        job.status = JobStatus::Processing;
        job.stage = JobStage::Parsing;
        assert!(job
            .apply(JobEvent::AdvanceStage(JobStage::Embedding), Utc::now())
            .is_err());
    }

    #[test]
    fn started_at_is_sticky_across_leases() {
        let job = queued_job();
        let job = apply(&job, JobEvent::UploadComplete).job;
        let job = apply(&job, JobEvent::Lease).job;
        let first_start = job.started_at;

        let job = apply(
            &job,
            JobEvent::Fail {
                code: ErrorCode::Timeout,
                message: "t".into(),
            },
        )
        .job;
        let job = apply(&job, JobEvent::Lease).job;
        assert_eq!(job.started_at, first_start);
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(30));
        assert_eq!(backoff_delay(2), Duration::from_secs(60));
        assert_eq!(backoff_delay(3), Duration::from_secs(120));
        assert_eq!(backoff_delay(7), Duration::from_secs(1800));
        assert_eq!(backoff_delay(50), Duration::from_secs(1800));
        // Attempt accounting starts at 1; zero behaves like the first retry.
        assert_eq!(backoff_delay(0), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(60);
        for _ in 0..100 {
            let delayed = jittered(base);
            assert!(delayed >= base);
            assert!(delayed <= base + Duration::from_secs(6));
        }
    }
}
