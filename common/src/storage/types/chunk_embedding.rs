use chrono::{DateTime, Utc};
use pgvector::Vector;
use uuid::Uuid;

use crate::error::AppError;
use crate::storage::db::Database;

pub const EMBEDDING_DIMENSIONS: usize = 1536;

/// One vector per chunk. When a job reaches `done`, every chunk of its
/// version has exactly one embedding row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChunkEmbedding {
    pub id: Uuid,
    pub chunk_id: Uuid,
    pub business_id: Uuid,
    pub embedding: Vector,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

impl ChunkEmbedding {
    /// Replaces the embeddings for a version's chunks in one transaction, in
    /// chunk order. `vectors` must line up with `chunk_ids`.
    pub async fn replace_for_chunks(
        business_id: Uuid,
        version_id: Uuid,
        chunk_ids: &[Uuid],
        vectors: Vec<Vec<f32>>,
        model: &str,
        db: &Database,
    ) -> Result<(), AppError> {
        if chunk_ids.len() != vectors.len() {
            return Err(AppError::InternalError(format!(
                "embedding count {} does not match chunk count {}",
                vectors.len(),
                chunk_ids.len()
            )));
        }
        for vector in &vectors {
            if vector.len() != EMBEDDING_DIMENSIONS {
                return Err(AppError::InternalError(format!(
                    "embedding has {} dimensions, expected {EMBEDDING_DIMENSIONS}",
                    vector.len()
                )));
            }
        }

        let mut tx = db.pool.begin().await?;

        sqlx::query(
            "DELETE FROM chunk_embedding
             WHERE chunk_id IN (SELECT id FROM document_chunk WHERE version_id = $1)",
        )
        .bind(version_id)
        .execute(&mut *tx)
        .await?;

        for (chunk_id, vector) in chunk_ids.iter().zip(vectors) {
            sqlx::query(
                "INSERT INTO chunk_embedding (id, chunk_id, business_id, embedding, model)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(Uuid::new_v4())
            .bind(chunk_id)
            .bind(business_id)
            .bind(Vector::from(vector))
            .bind(model)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn count_for_version(version_id: Uuid, db: &Database) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM chunk_embedding e
             JOIN document_chunk c ON c.id = e.chunk_id
             WHERE c.version_id = $1",
        )
        .bind(version_id)
        .fetch_one(&db.pool)
        .await?;

        Ok(count)
    }
}
