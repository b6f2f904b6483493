//! Repository and outbox behavior against a real Postgres. These run with
//! `cargo test -- --ignored` against a provisioned database.

use chrono::Utc;
use common::documents;
use common::storage::db::Database;
use common::storage::store::StorageManager;
use common::storage::types::chunk_embedding::{ChunkEmbedding, EMBEDDING_DIMENSIONS};
use common::storage::types::document::{Document, DocumentStatus};
use common::storage::types::document_chunk::{DocumentChunk, NewChunk};
use common::storage::types::document_page::{DocumentPage, NewPage};
use common::storage::types::document_version::DocumentVersion;
use common::storage::types::event_outbox::OutboxEvent;
use common::storage::types::ingestion_job::{IngestionJob, JobStage, JobStatus};
use sqlx::PgPool;
use uuid::Uuid;

const MAX_FILE_SIZE: u64 = 52_428_800;

async fn init(db: &Database) -> documents::InitUploadResponse {
    documents::init_upload(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "Quarterly report",
        "report.pdf",
        "application/pdf",
        900,
        db,
        &StorageManager::memory(),
    )
    .await
    .expect("init upload")
}

#[ignore = "requires a running Postgres"]
#[sqlx::test(migrator = "common::storage::db::MIGRATOR")]
async fn version_numbers_are_dense_from_one(pool: PgPool) {
    let db = Database::from_pool(pool);
    let business_id = Uuid::new_v4();

    let mut tx = db.pool.begin().await.expect("tx");
    let document = Document::create(business_id, "Doc", "doc.pdf", Uuid::new_v4(), &mut tx)
        .await
        .expect("create document");
    for _ in 0..3 {
        DocumentVersion::reserve(business_id, document.id, "application/pdf", &mut tx)
            .await
            .expect("reserve");
    }
    tx.commit().await.expect("commit");

    let versions = DocumentVersion::list_for_document(document.id, &db)
        .await
        .expect("list");
    assert_eq!(
        versions.iter().map(|v| v.version_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(versions[0].object_key.ends_with("/v1/original"));
    assert!(versions[0].file_size.is_none(), "reserved, not materialized");
}

#[ignore = "requires a running Postgres"]
#[sqlx::test(migrator = "common::storage::db::MIGRATOR")]
async fn upload_protocol_reserves_then_queues(pool: PgPool) {
    let db = Database::from_pool(pool);
    let upload = init(&db).await;

    let job = IngestionJob::get(upload.job_id, &db).await.expect("job");
    assert_eq!((job.status, job.stage), (JobStatus::Queued, JobStage::PendingUpload));

    documents::complete_upload(job.business_id, upload.version_id, 1024, MAX_FILE_SIZE, &db)
        .await
        .expect("complete upload");

    let job = IngestionJob::get(upload.job_id, &db).await.expect("job");
    assert_eq!((job.status, job.stage), (JobStatus::Queued, JobStage::Uploaded));

    let version = DocumentVersion::get(upload.version_id, &db).await.expect("version");
    assert_eq!(version.file_size, Some(1024));

    let events = OutboxEvent::lease_batch("w1", 300, 10, &db).await.expect("lease");
    assert_eq!(events.len(), 1);
    let payload = events[0].ingestion_payload().expect("payload");
    assert_eq!(payload.version_id, upload.version_id);
    assert_eq!(payload.job_id, upload.job_id);
}

#[ignore = "requires a running Postgres"]
#[sqlx::test(migrator = "common::storage::db::MIGRATOR")]
async fn oversized_upload_is_rejected(pool: PgPool) {
    let db = Database::from_pool(pool);
    let upload = init(&db).await;
    let job = IngestionJob::get(upload.job_id, &db).await.expect("job");

    let err = documents::complete_upload(job.business_id, upload.version_id, 2048, 1024, &db)
        .await
        .expect_err("should reject");
    assert_eq!(err.code(), common::error::ErrorCode::FileTooLarge);
}

#[ignore = "requires a running Postgres"]
#[sqlx::test(migrator = "common::storage::db::MIGRATOR")]
async fn page_replacement_is_idempotent(pool: PgPool) {
    let db = Database::from_pool(pool);
    let upload = init(&db).await;
    let job = IngestionJob::get(upload.job_id, &db).await.expect("job");

    let pages: Vec<NewPage> = (1..=3)
        .map(|n| NewPage {
            page_number: n,
            content: format!("content of page {n}"),
        })
        .collect();

    for _ in 0..2 {
        DocumentPage::replace_for_version(job.business_id, upload.version_id, &pages, &db)
            .await
            .expect("replace pages");
    }

    let stored = DocumentPage::list_for_version(upload.version_id, &db)
        .await
        .expect("list");
    assert_eq!(
        stored.iter().map(|p| p.page_number).collect::<Vec<_>>(),
        vec![1, 2, 3],
        "page numbers stay contiguous after a replay"
    );
    assert_eq!(stored[1].char_count, "content of page 2".len() as i32);
}

#[ignore = "requires a running Postgres"]
#[sqlx::test(migrator = "common::storage::db::MIGRATOR")]
async fn embedding_coverage_survives_replay(pool: PgPool) {
    let db = Database::from_pool(pool);
    let upload = init(&db).await;
    let job = IngestionJob::get(upload.job_id, &db).await.expect("job");

    let chunks: Vec<NewChunk> = (0..2)
        .map(|i| NewChunk {
            chunk_index: i,
            content: format!("chunk {i}"),
            page_start: 1,
            page_end: 1,
            sentences: vec![format!("chunk {i}")],
        })
        .collect();

    // Replay the whole chunk+embed stage pair twice: still one embedding
    // per chunk at the end.
    for _ in 0..2 {
        let ids = DocumentChunk::replace_for_version(job.business_id, upload.version_id, &chunks, &db)
            .await
            .expect("replace chunks");
        let vectors = vec![vec![0.1_f32; EMBEDDING_DIMENSIONS]; ids.len()];
        ChunkEmbedding::replace_for_chunks(
            job.business_id,
            upload.version_id,
            &ids,
            vectors,
            "text-embedding-3-small",
            &db,
        )
        .await
        .expect("replace embeddings");
    }

    let chunk_rows = DocumentChunk::list_for_version(upload.version_id, &db)
        .await
        .expect("chunks");
    assert_eq!(chunk_rows.len(), 2);
    let embedding_count = ChunkEmbedding::count_for_version(upload.version_id, &db)
        .await
        .expect("count");
    assert_eq!(embedding_count, 2);
}

#[ignore = "requires a running Postgres"]
#[sqlx::test(migrator = "common::storage::db::MIGRATOR")]
async fn mismatched_embedding_count_is_rejected(pool: PgPool) {
    let db = Database::from_pool(pool);
    let upload = init(&db).await;
    let job = IngestionJob::get(upload.job_id, &db).await.expect("job");

    let ids = DocumentChunk::replace_for_version(
        job.business_id,
        upload.version_id,
        &[NewChunk {
            chunk_index: 0,
            content: "only chunk".into(),
            page_start: 1,
            page_end: 1,
            sentences: vec!["only chunk".into()],
        }],
        &db,
    )
    .await
    .expect("replace chunks");

    let err = ChunkEmbedding::replace_for_chunks(
        job.business_id,
        upload.version_id,
        &ids,
        vec![],
        "m",
        &db,
    )
    .await
    .expect_err("count mismatch");
    assert!(err.to_string().contains("does not match"));
}

#[ignore = "requires a running Postgres"]
#[sqlx::test(migrator = "common::storage::db::MIGRATOR")]
async fn outbox_lease_hides_rows_until_expiry(pool: PgPool) {
    let db = Database::from_pool(pool);
    let business_id = Uuid::new_v4();

    let mut tx = db.pool.begin().await.expect("tx");
    OutboxEvent::enqueue(business_id, "document.ingestion_requested", serde_json::json!({}), &mut tx)
        .await
        .expect("enqueue");
    tx.commit().await.expect("commit");

    let first = OutboxEvent::lease_batch("w1", 300, 10, &db).await.expect("lease");
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].attempts, 1, "leasing counts as a delivery attempt");

    // Leased rows are invisible to other pollers.
    let second = OutboxEvent::lease_batch("w2", 300, 10, &db).await.expect("lease");
    assert!(second.is_empty());

    // Released for retry with a past window: visible again.
    OutboxEvent::release_for_retry(first[0].id, Utc::now(), "transient", &db)
        .await
        .expect("release");
    let third = OutboxEvent::lease_batch("w2", 300, 10, &db).await.expect("lease");
    assert_eq!(third.len(), 1);
    assert_eq!(third[0].attempts, 2);
}

#[ignore = "requires a running Postgres"]
#[sqlx::test(migrator = "common::storage::db::MIGRATOR")]
async fn processed_events_never_reappear(pool: PgPool) {
    let db = Database::from_pool(pool);
    let business_id = Uuid::new_v4();

    let mut tx = db.pool.begin().await.expect("tx");
    let event_id = OutboxEvent::enqueue(business_id, "document.ingestion_requested", serde_json::json!({}), &mut tx)
        .await
        .expect("enqueue");
    tx.commit().await.expect("commit");

    OutboxEvent::lease_batch("w1", 300, 10, &db).await.expect("lease");
    OutboxEvent::mark_processed(event_id, &db).await.expect("commit event");
    // Replaying the commit is a no-op.
    OutboxEvent::mark_processed(event_id, &db).await.expect("replay commit");

    OutboxEvent::release_for_retry(event_id, Utc::now(), "late release", &db)
        .await
        .expect("late release is a no-op");
    let leased = OutboxEvent::lease_batch("w1", 300, 10, &db).await.expect("lease");
    assert!(leased.is_empty());
}

#[ignore = "requires a running Postgres"]
#[sqlx::test(migrator = "common::storage::db::MIGRATOR")]
async fn exhausted_events_poison_but_stay_visible_for_audit(pool: PgPool) {
    let db = Database::from_pool(pool);
    let business_id = Uuid::new_v4();

    let mut tx = db.pool.begin().await.expect("tx");
    OutboxEvent::enqueue(business_id, "document.ingestion_requested", serde_json::json!({}), &mut tx)
        .await
        .expect("enqueue");
    tx.commit().await.expect("commit");

    for _ in 0..3 {
        let leased = OutboxEvent::lease_batch("w1", 300, 10, &db).await.expect("lease");
        assert_eq!(leased.len(), 1);
        OutboxEvent::release_for_retry(leased[0].id, Utc::now(), "still failing", &db)
            .await
            .expect("release");
    }

    assert!(OutboxEvent::lease_batch("w1", 300, 10, &db).await.expect("lease").is_empty());
    let poisoned = OutboxEvent::poisoned(&db).await.expect("poisoned");
    assert_eq!(poisoned.len(), 1);
    assert_eq!(poisoned[0].attempts, 3);
    assert!(poisoned[0].processed_at.is_none());
}

#[ignore = "requires a running Postgres"]
#[sqlx::test(migrator = "common::storage::db::MIGRATOR")]
async fn delete_cancels_non_terminal_jobs(pool: PgPool) {
    let db = Database::from_pool(pool);
    let upload = init(&db).await;
    let job = IngestionJob::get(upload.job_id, &db).await.expect("job");

    documents::delete_document(job.business_id, upload.document_id, &db)
        .await
        .expect("delete");

    let document = Document::get(job.business_id, upload.document_id, &db)
        .await
        .expect("document");
    assert_eq!(document.status, DocumentStatus::DeletedPending);

    let job = IngestionJob::get(upload.job_id, &db).await.expect("job");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code.as_deref(), Some("document_deleted"));
    assert!(job.completed_at.is_some());

    // Deleted documents freeze their metadata.
    let err = documents::patch_document(
        job.business_id,
        upload.document_id,
        common::storage::types::document::DocumentPatch {
            title: Some("New title".into()),
            labels: None,
        },
        &db,
    )
    .await;
    assert!(err.is_err());
}

#[ignore = "requires a running Postgres"]
#[sqlx::test(migrator = "common::storage::db::MIGRATOR")]
async fn cancel_job_is_terminal_and_tenant_scoped(pool: PgPool) {
    let db = Database::from_pool(pool);
    let upload = init(&db).await;
    let job = IngestionJob::get(upload.job_id, &db).await.expect("job");

    // Foreign tenants cannot cancel.
    assert!(documents::cancel_job(Uuid::new_v4(), upload.job_id, &db).await.is_err());

    let view = documents::cancel_job(job.business_id, upload.job_id, &db)
        .await
        .expect("cancel");
    assert_eq!(view.status, JobStatus::Cancelled);
    assert!(view.completed_at.is_some());

    let stored = IngestionJob::get(upload.job_id, &db).await.expect("job");
    assert_eq!(stored.status, JobStatus::Cancelled);

    // Cancelled is terminal: a second cancel rejects.
    assert!(documents::cancel_job(job.business_id, upload.job_id, &db).await.is_err());
}

#[ignore = "requires a running Postgres"]
#[sqlx::test(migrator = "common::storage::db::MIGRATOR")]
async fn job_view_is_tenant_scoped(pool: PgPool) {
    let db = Database::from_pool(pool);
    let upload = init(&db).await;
    let job = IngestionJob::get(upload.job_id, &db).await.expect("job");

    let view = documents::get_job(job.business_id, upload.job_id, &db)
        .await
        .expect("view");
    assert_eq!(view.status, JobStatus::Queued);
    assert_eq!(view.attempts, 0);

    let other_tenant = documents::get_job(Uuid::new_v4(), upload.job_id, &db).await;
    assert!(other_tenant.is_err(), "foreign tenants see nothing");
}
