use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::storage::db::Database;

/// Chunker output with citation provenance: indices are 0-based and
/// contiguous, `page_start <= page_end`, and `page_start` is non-decreasing
/// across indices.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct DocumentChunk {
    pub id: Uuid,
    pub version_id: Uuid,
    pub business_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub page_start: i32,
    pub page_end: i32,
    pub sentences: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_index: i32,
    pub content: String,
    pub page_start: i32,
    pub page_end: i32,
    pub sentences: Vec<String>,
}

impl DocumentChunk {
    /// Replaces all chunks for a version in one transaction (cascades to any
    /// previously committed embeddings), so a retried chunking stage never
    /// duplicates rows.
    pub async fn replace_for_version(
        business_id: Uuid,
        version_id: Uuid,
        chunks: &[NewChunk],
        db: &Database,
    ) -> Result<Vec<Uuid>, AppError> {
        let mut tx = db.pool.begin().await?;

        sqlx::query("DELETE FROM document_chunk WHERE version_id = $1")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;

        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO document_chunk
                     (id, version_id, business_id, chunk_index, content,
                      page_start, page_end, sentences)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(id)
            .bind(version_id)
            .bind(business_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.page_start)
            .bind(chunk.page_end)
            .bind(serde_json::to_value(&chunk.sentences)?)
            .execute(&mut *tx)
            .await?;
            ids.push(id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    pub async fn list_for_version(version_id: Uuid, db: &Database) -> Result<Vec<Self>, AppError> {
        let chunks = sqlx::query_as::<_, DocumentChunk>(
            "SELECT * FROM document_chunk WHERE version_id = $1 ORDER BY chunk_index",
        )
        .bind(version_id)
        .fetch_all(&db.pool)
        .await?;

        Ok(chunks)
    }
}
