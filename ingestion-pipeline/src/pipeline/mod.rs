//! The ingestion coordinator: download, parse, gate, chunk, embed, commit.
//!
//! Each stage persists through a delete-then-insert repository call inside
//! one transaction, so a retried job can replay its stage without
//! duplicating rows. Document deletion is observed at every stage
//! boundary; each stage runs under its own deadline.

mod config;

pub use config::IngestionTuning;

use std::future::Future;
use std::time::Instant;

use chrono::Utc;
use common::error::{AppError, ErrorCode};
use common::storage::db::Database;
use common::storage::store::StorageManager;
use common::storage::types::chunk_embedding::ChunkEmbedding;
use common::storage::types::document::{Document, DocumentStatus};
use common::storage::types::document_chunk::{DocumentChunk, NewChunk};
use common::storage::types::document_page::{DocumentPage, NewPage};
use common::storage::types::document_version::DocumentVersion;
use common::storage::types::ingestion_job::{IngestionJob, JobEvent, JobStage};
use common::utils::config::AppConfig;
use tracing::{info, warn};

use crate::chunker::{PageText, SemanticChunker};
use crate::embedding::EmbeddingClient;
use crate::parsers;
use crate::quality::{self, GateOutcome};

pub struct IngestionPipeline {
    db: Database,
    storage: StorageManager,
    embeddings: EmbeddingClient,
    chunker: SemanticChunker,
    tuning: IngestionTuning,
    max_file_size_bytes: u64,
}

impl IngestionPipeline {
    pub fn new(
        db: Database,
        storage: StorageManager,
        embeddings: EmbeddingClient,
        config: &AppConfig,
    ) -> Self {
        Self::with_tuning(db, storage, embeddings, config, IngestionTuning::default())
    }

    pub fn with_tuning(
        db: Database,
        storage: StorageManager,
        embeddings: EmbeddingClient,
        config: &AppConfig,
        tuning: IngestionTuning,
    ) -> Self {
        Self {
            db,
            storage,
            embeddings,
            chunker: SemanticChunker::new(tuning.chunker.clone()),
            tuning,
            max_file_size_bytes: config.max_file_size_bytes,
        }
    }

    /// Drives a freshly leased job to `done`. Errors bubble to the
    /// dispatcher, which owns the retry-or-fail transition.
    #[tracing::instrument(
        skip_all,
        fields(job_id = %job.id, attempt = job.attempts, stage = ?job.stage)
    )]
    pub async fn run(&self, job: IngestionJob) -> Result<IngestionJob, AppError> {
        let pipeline_started = Instant::now();
        let version = DocumentVersion::get(job.version_id, &self.db).await?;

        let job = match job.stage {
            JobStage::Parsing => {
                let job = self.parse_stage(job, &version).await?;
                let job = self.chunk_stage(job, &version).await?;
                self.embed_stage(job, &version).await?
            }
            JobStage::Chunking => {
                let job = self.chunk_stage(job, &version).await?;
                self.embed_stage(job, &version).await?
            }
            JobStage::Embedding => self.embed_stage(job, &version).await?,
            other => {
                return Err(AppError::InternalError(format!(
                    "leased job {} is in stage {other:?}, nothing to run",
                    job.id
                )))
            }
        };

        info!(
            total_ms = pipeline_started.elapsed().as_millis() as u64,
            "ingestion pipeline finished"
        );

        Ok(job)
    }

    /// Download, parse, gate, persist pages.
    async fn parse_stage(
        &self,
        job: IngestionJob,
        version: &DocumentVersion,
    ) -> Result<IngestionJob, AppError> {
        self.ensure_document_active(&job, version).await?;
        let stage_started = Instant::now();

        let (pages, parsed_meta) = self
            .with_deadline(self.tuning.parse_deadline, "parse", async {
                let bytes = self.storage.download(&version.object_key).await?;
                if bytes.len() as u64 > self.max_file_size_bytes {
                    return Err(AppError::ingestion(
                        ErrorCode::FileTooLarge,
                        format!(
                            "{} bytes exceeds the {} byte limit",
                            bytes.len(),
                            self.max_file_size_bytes
                        ),
                    ));
                }
                if let Some(declared) = version.file_size {
                    if declared != bytes.len() as i64 {
                        warn!(declared, actual = bytes.len(), "uploaded size differs from declared size");
                    }
                }
                DocumentVersion::record_content_hash(
                    version.id,
                    &common::documents::sha256_hex(&bytes),
                    &self.db,
                )
                .await?;

                // Parsers are CPU-bound; keep them off the async executor.
                let mime_type = version.mime_type.clone();
                let source_type = job.source_type;
                let parsed = tokio::task::spawn_blocking(move || {
                    parsers::parse(&bytes, &mime_type, source_type)
                })
                .await??;

                match quality::evaluate(&parsed.pages) {
                    GateOutcome::Pass { warnings } => {
                        for warning in warnings {
                            warn!(%warning, "extraction quality warning");
                        }
                    }
                    GateOutcome::Fail { code, reason } => {
                        return Err(AppError::ingestion(code, reason));
                    }
                }

                let pages: Vec<NewPage> = parsed
                    .pages
                    .iter()
                    .map(|p| NewPage {
                        page_number: p.page_number,
                        content: p.content.clone(),
                    })
                    .collect();
                DocumentPage::replace_for_version(job.business_id, version.id, &pages, &self.db)
                    .await?;

                Ok((pages, parsed))
            })
            .await?;

        let mut job = self.advance(job, JobStage::Chunking).await?;
        self.merge_metrics(
            &mut job,
            serde_json::json!({
                "pageCount": pages.len(),
                "totalWords": parsed_meta.word_count,
                "totalChars": parsed_meta.char_count,
                "parserUsed": parsed_meta.parser,
                "parseMs": stage_started.elapsed().as_millis() as u64,
            }),
        )
        .await?;

        info!(
            pages = pages.len(),
            parser = parsed_meta.parser,
            duration_ms = stage_started.elapsed().as_millis() as u64,
            "parse stage committed"
        );

        Ok(job)
    }

    /// Chunk the persisted pages and persist the chunks.
    async fn chunk_stage(
        &self,
        job: IngestionJob,
        version: &DocumentVersion,
    ) -> Result<IngestionJob, AppError> {
        self.ensure_document_active(&job, version).await?;
        let stage_started = Instant::now();

        let chunk_count = self
            .with_deadline(self.tuning.chunk_deadline, "chunk", async {
                let pages = DocumentPage::list_for_version(version.id, &self.db).await?;
                let page_texts: Vec<PageText> = pages
                    .into_iter()
                    .map(|p| PageText {
                        page_number: p.page_number,
                        text: p.content,
                    })
                    .collect();

                let chunks = self.chunker.chunk(&page_texts);
                let new_chunks: Vec<NewChunk> = chunks
                    .into_iter()
                    .map(|c| NewChunk {
                        chunk_index: c.index,
                        content: c.content,
                        page_start: c.page_start,
                        page_end: c.page_end,
                        sentences: c.sentences,
                    })
                    .collect();

                DocumentChunk::replace_for_version(
                    job.business_id,
                    version.id,
                    &new_chunks,
                    &self.db,
                )
                .await?;

                Ok(new_chunks.len())
            })
            .await?;

        let mut job = self.advance(job, JobStage::Embedding).await?;
        self.merge_metrics(
            &mut job,
            serde_json::json!({
                "chunkCount": chunk_count,
                "chunkMs": stage_started.elapsed().as_millis() as u64,
            }),
        )
        .await?;

        info!(
            chunks = chunk_count,
            duration_ms = stage_started.elapsed().as_millis() as u64,
            "chunk stage committed"
        );

        Ok(job)
    }

    /// Embed the persisted chunks, persist vectors, and complete the job.
    async fn embed_stage(
        &self,
        job: IngestionJob,
        version: &DocumentVersion,
    ) -> Result<IngestionJob, AppError> {
        self.ensure_document_active(&job, version).await?;
        let stage_started = Instant::now();

        let embedded = self
            .with_deadline(self.tuning.embed_deadline, "embed", async {
                let chunks = DocumentChunk::list_for_version(version.id, &self.db).await?;
                let chunk_ids: Vec<_> = chunks.iter().map(|c| c.id).collect();
                let texts: Vec<String> = chunks.into_iter().map(|c| c.content).collect();

                let vectors = self.embeddings.embed(&texts).await?;
                ChunkEmbedding::replace_for_chunks(
                    job.business_id,
                    version.id,
                    &chunk_ids,
                    vectors,
                    self.embeddings.model(),
                    &self.db,
                )
                .await?;

                Ok(chunk_ids.len())
            })
            .await?;

        let mut metrics = job
            .metrics
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));
        if let Some(map) = metrics.as_object_mut() {
            map.insert("embeddingModel".into(), self.embeddings.model().into());
            map.insert(
                "embedMs".into(),
                (stage_started.elapsed().as_millis() as u64).into(),
            );
        }

        let transition = job.apply(JobEvent::Complete { metrics }, Utc::now())?;
        IngestionJob::persist(&transition.job, &self.db.pool).await?;

        info!(
            embeddings = embedded,
            duration_ms = stage_started.elapsed().as_millis() as u64,
            "embeddings committed, job done"
        );

        Ok(transition.job)
    }

    /// Deletion check at stage boundaries: a deleted document aborts the
    /// job cleanly instead of finishing work nobody can see.
    async fn ensure_document_active(
        &self,
        job: &IngestionJob,
        version: &DocumentVersion,
    ) -> Result<(), AppError> {
        let document = Document::get(job.business_id, version.document_id, &self.db).await?;
        if document.status != DocumentStatus::Active {
            return Err(AppError::ingestion(
                ErrorCode::DocumentDeleted,
                format!("document {} is {:?}", document.id, document.status),
            ));
        }
        Ok(())
    }

    async fn advance(&self, job: IngestionJob, stage: JobStage) -> Result<IngestionJob, AppError> {
        let transition = job.apply(JobEvent::AdvanceStage(stage), Utc::now())?;
        IngestionJob::persist(&transition.job, &self.db.pool).await?;
        Ok(transition.job)
    }

    /// The metrics bag is plain data owned by the coordinator; it rides on
    /// the row but is not part of the state machine.
    async fn merge_metrics(
        &self,
        job: &mut IngestionJob,
        additions: serde_json::Value,
    ) -> Result<(), AppError> {
        let mut merged = job
            .metrics
            .take()
            .unwrap_or_else(|| serde_json::json!({}));
        if let (Some(into), Some(from)) = (merged.as_object_mut(), additions.as_object()) {
            for (key, value) in from {
                into.insert(key.clone(), value.clone());
            }
        }
        job.metrics = Some(merged);
        IngestionJob::persist(job, &self.db.pool).await?;
        Ok(())
    }

    async fn with_deadline<T>(
        &self,
        deadline: std::time::Duration,
        stage: &str,
        fut: impl Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(AppError::ingestion(
                ErrorCode::Timeout,
                format!("{stage} stage deadline of {}s elapsed", deadline.as_secs()),
            )),
        }
    }
}
