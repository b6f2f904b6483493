//! Upload and versioning protocol: the library operations the HTTP facade
//! calls. Each operation is one short transaction plus, where a client
//! needs to talk to the object store, a presigned URL.

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AppError, ErrorCode};
use crate::storage::db::Database;
use crate::storage::store::StorageManager;
use crate::storage::types::document::{Document, DocumentPatch};
use crate::storage::types::document_version::DocumentVersion;
use crate::storage::types::event_outbox::{
    IngestionRequested, OutboxEvent, EVENT_DOCUMENT_INGESTION_REQUESTED,
};
use crate::storage::types::ingestion_job::{IngestionJob, JobEvent, JobStage, JobStatus};
use crate::storage::types::source_type::SourceType;

#[derive(Debug, Clone, serde::Serialize)]
pub struct InitUploadResponse {
    #[serde(rename = "documentId")]
    pub document_id: Uuid,
    #[serde(rename = "versionId")]
    pub version_id: Uuid,
    #[serde(rename = "jobId")]
    pub job_id: Uuid,
    #[serde(rename = "objectKey")]
    pub object_key: String,
    #[serde(rename = "uploadUrl")]
    pub upload_url: String,
    #[serde(rename = "expiresIn")]
    pub expires_in: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobView {
    pub status: JobStatus,
    pub stage: JobStage,
    pub attempts: i32,
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "startedAt")]
    pub started_at: Option<chrono::DateTime<Utc>>,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<chrono::DateTime<Utc>>,
    #[serde(rename = "nextRetryAt")]
    pub next_retry_at: Option<chrono::DateTime<Utc>>,
}

impl From<IngestionJob> for JobView {
    fn from(job: IngestionJob) -> Self {
        Self {
            status: job.status,
            stage: job.stage,
            attempts: job.attempts,
            error_code: job.error_code,
            last_error: job.last_error,
            started_at: job.started_at,
            completed_at: job.completed_at,
            next_retry_at: job.next_retry_at,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Reserves an object key and creates document + version 1 + job in one
/// transaction, then hands back a presigned PUT URL for the client.
#[tracing::instrument(skip(db, storage), fields(business_id = %business_id))]
pub async fn init_upload(
    business_id: Uuid,
    uploaded_by: Uuid,
    title: &str,
    filename: &str,
    content_type: &str,
    upload_url_ttl_secs: u64,
    db: &Database,
    storage: &StorageManager,
) -> Result<InitUploadResponse, AppError> {
    if title.trim().is_empty() {
        return Err(AppError::Validation("title must not be empty".into()));
    }
    let source_type = SourceType::from_filename(filename).ok_or_else(|| {
        AppError::ingestion(
            ErrorCode::UnsupportedFormat,
            format!("unsupported file extension: {filename}"),
        )
    })?;

    let mut tx = db.pool.begin().await?;
    let document = Document::create(business_id, title, filename, uploaded_by, &mut tx).await?;
    let version = DocumentVersion::reserve(business_id, document.id, content_type, &mut tx).await?;
    let job = IngestionJob::create(business_id, version.id, source_type, &mut tx).await?;
    tx.commit().await?;

    let upload = storage
        .upload_url(&version.object_key, content_type, upload_url_ttl_secs)
        .await?;

    tracing::info!(
        document_id = %document.id,
        version_id = %version.id,
        job_id = %job.id,
        source_type = %source_type,
        "upload initialized"
    );

    Ok(InitUploadResponse {
        document_id: document.id,
        version_id: version.id,
        job_id: job.id,
        object_key: version.object_key,
        upload_url: upload.url,
        expires_in: upload.expires_in,
    })
}

/// Marks the version materialized and enqueues the ingestion event. Version
/// update, job transition, and outbox row commit in the same transaction.
#[tracing::instrument(skip(db), fields(business_id = %business_id, version_id = %version_id))]
pub async fn complete_upload(
    business_id: Uuid,
    version_id: Uuid,
    file_size: i64,
    max_file_size_bytes: u64,
    db: &Database,
) -> Result<(), AppError> {
    if file_size <= 0 {
        return Err(AppError::Validation("file size must be positive".into()));
    }
    if file_size as u64 > max_file_size_bytes {
        return Err(AppError::ingestion(
            ErrorCode::FileTooLarge,
            format!("{file_size} bytes exceeds the {max_file_size_bytes} byte limit"),
        ));
    }

    let mut tx = db.pool.begin().await?;
    DocumentVersion::materialize(business_id, version_id, file_size, &mut tx).await?;

    let job = sqlx::query_as::<_, IngestionJob>(
        "SELECT * FROM ingestion_job
         WHERE version_id = $1 AND status = 'queued' AND stage = 'pending_upload'
         ORDER BY created_at DESC
         LIMIT 1
         FOR UPDATE",
    )
    .bind(version_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("pending job for version {version_id}")))?;

    let transition = job.apply(JobEvent::UploadComplete, Utc::now())?;
    IngestionJob::persist(&transition.job, &mut *tx).await?;

    OutboxEvent::enqueue(
        business_id,
        EVENT_DOCUMENT_INGESTION_REQUESTED,
        serde_json::to_value(IngestionRequested {
            version_id,
            job_id: job.id,
            tenant_id: business_id,
        })?,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    tracing::info!(job_id = %job.id, file_size, "upload completed, ingestion queued");

    Ok(())
}

pub async fn list_documents(business_id: Uuid, db: &Database) -> Result<Vec<Document>, AppError> {
    Document::list(business_id, db).await
}

pub async fn get_document(
    business_id: Uuid,
    document_id: Uuid,
    db: &Database,
) -> Result<Document, AppError> {
    Document::get(business_id, document_id, db).await
}

pub async fn patch_document(
    business_id: Uuid,
    document_id: Uuid,
    patch: DocumentPatch,
    db: &Database,
) -> Result<Document, AppError> {
    Document::patch(business_id, document_id, patch, db).await
}

/// User delete: the document goes to `deleted_pending` and every
/// non-terminal job for any of its versions ends with `document_deleted`,
/// all in one transaction. Workers observe the document status at stage
/// boundaries, so an in-flight job also stops at its next boundary.
#[tracing::instrument(skip(db), fields(business_id = %business_id, document_id = %document_id))]
pub async fn delete_document(
    business_id: Uuid,
    document_id: Uuid,
    db: &Database,
) -> Result<(), AppError> {
    let mut tx = db.pool.begin().await?;
    Document::mark_deleted_pending(business_id, document_id, &mut tx).await?;

    let jobs = IngestionJob::non_terminal_for_document(document_id, &mut tx).await?;
    let job_count = jobs.len();
    for job in jobs {
        let transition = job.apply(JobEvent::DocumentDeleted, Utc::now())?;
        IngestionJob::persist(&transition.job, &mut *tx).await?;
    }
    tx.commit().await?;

    tracing::info!(cancelled_jobs = job_count, "document marked for deletion");

    Ok(())
}

pub async fn get_job(business_id: Uuid, job_id: Uuid, db: &Database) -> Result<JobView, AppError> {
    let job = IngestionJob::get(job_id, db).await?;
    if job.business_id != business_id {
        return Err(AppError::NotFound(format!("ingestion job {job_id}")));
    }

    Ok(job.into())
}

/// Operator cancel for a single job: ends it without touching the
/// document. A cancelled job keeps its version and any committed rows;
/// re-uploading creates a fresh version and job. Terminal jobs reject the
/// transition.
#[tracing::instrument(skip(db), fields(business_id = %business_id, job_id = %job_id))]
pub async fn cancel_job(
    business_id: Uuid,
    job_id: Uuid,
    db: &Database,
) -> Result<JobView, AppError> {
    let job = IngestionJob::get(job_id, db).await?;
    if job.business_id != business_id {
        return Err(AppError::NotFound(format!("ingestion job {job_id}")));
    }

    let transition = job.apply(JobEvent::Cancel, Utc::now())?;
    IngestionJob::persist(&transition.job, &db.pool).await?;

    tracing::info!(attempts = transition.job.attempts, "ingestion job cancelled");

    Ok(transition.job.into())
}
