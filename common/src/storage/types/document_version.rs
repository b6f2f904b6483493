use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::storage::db::Database;
use crate::storage::store;

/// Immutable snapshot of one upload. Created in a reserved state with no
/// bytes; materialized when the upload completes with size and hash.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct DocumentVersion {
    pub id: Uuid,
    pub document_id: Uuid,
    pub business_id: Uuid,
    pub version_number: i32,
    pub object_key: String,
    pub mime_type: String,
    pub file_size: Option<i64>,
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DocumentVersion {
    /// Reserves the next version slot for a document. Version numbers are
    /// dense and start at 1; the unique constraint on
    /// `(document_id, version_number)` backstops concurrent reservations.
    pub async fn reserve(
        business_id: Uuid,
        document_id: Uuid,
        mime_type: &str,
        tx: &mut sqlx::PgTransaction<'_>,
    ) -> Result<Self, AppError> {
        let id = Uuid::new_v4();
        let version_number: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version_number), 0) + 1
             FROM document_version WHERE document_id = $1",
        )
        .bind(document_id)
        .fetch_one(&mut **tx)
        .await?;

        let object_key = store::generate_key(business_id, document_id, version_number);

        let version = sqlx::query_as::<_, DocumentVersion>(
            "INSERT INTO document_version
                 (id, document_id, business_id, version_number, object_key, mime_type)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING *",
        )
        .bind(id)
        .bind(document_id)
        .bind(business_id)
        .bind(version_number)
        .bind(object_key)
        .bind(mime_type)
        .fetch_one(&mut **tx)
        .await?;

        Ok(version)
    }

    /// Records the uploaded byte length. The content hash is attached once
    /// the worker has downloaded and hashed the object.
    pub async fn materialize(
        business_id: Uuid,
        id: Uuid,
        file_size: i64,
        tx: &mut sqlx::PgTransaction<'_>,
    ) -> Result<Self, AppError> {
        sqlx::query_as::<_, DocumentVersion>(
            "UPDATE document_version SET file_size = $3
             WHERE id = $1 AND business_id = $2
             RETURNING *",
        )
        .bind(id)
        .bind(business_id)
        .bind(file_size)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document version {id}")))
    }

    pub async fn record_content_hash(
        id: Uuid,
        content_hash: &str,
        db: &Database,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE document_version SET content_hash = $2 WHERE id = $1")
            .bind(id)
            .bind(content_hash)
            .execute(&db.pool)
            .await?;

        Ok(())
    }

    pub async fn get(id: Uuid, db: &Database) -> Result<Self, AppError> {
        sqlx::query_as::<_, DocumentVersion>("SELECT * FROM document_version WHERE id = $1")
            .bind(id)
            .fetch_optional(&db.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("document version {id}")))
    }

    pub async fn list_for_document(
        document_id: Uuid,
        db: &Database,
    ) -> Result<Vec<Self>, AppError> {
        let versions = sqlx::query_as::<_, DocumentVersion>(
            "SELECT * FROM document_version
             WHERE document_id = $1
             ORDER BY version_number",
        )
        .bind(document_id)
        .fetch_all(&db.pool)
        .await?;

        Ok(versions)
    }
}
