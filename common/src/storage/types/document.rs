use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::storage::db::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "document_status", rename_all = "snake_case")]
pub enum DocumentStatus {
    Active,
    DeletedPending,
    Deleted,
}

/// Business-scoped logical file. Owns an ordered sequence of versions; once
/// deleted, mutable metadata is frozen.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct Document {
    pub id: Uuid,
    pub business_id: Uuid,
    pub title: String,
    pub original_filename: String,
    pub status: DocumentStatus,
    pub uploaded_by: Uuid,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Mutable metadata accepted by the patch operation.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct DocumentPatch {
    pub title: Option<String>,
    pub labels: Option<Vec<String>>,
}

impl Document {
    pub async fn create(
        business_id: Uuid,
        title: &str,
        original_filename: &str,
        uploaded_by: Uuid,
        tx: &mut sqlx::PgTransaction<'_>,
    ) -> Result<Self, AppError> {
        let document = sqlx::query_as::<_, Document>(
            "INSERT INTO document (id, business_id, title, original_filename, uploaded_by)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(business_id)
        .bind(title)
        .bind(original_filename)
        .bind(uploaded_by)
        .fetch_one(&mut **tx)
        .await?;

        Ok(document)
    }

    pub async fn get(business_id: Uuid, id: Uuid, db: &Database) -> Result<Self, AppError> {
        sqlx::query_as::<_, Document>(
            "SELECT * FROM document WHERE id = $1 AND business_id = $2",
        )
        .bind(id)
        .bind(business_id)
        .fetch_optional(&db.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document {id}")))
    }

    pub async fn list(business_id: Uuid, db: &Database) -> Result<Vec<Self>, AppError> {
        let documents = sqlx::query_as::<_, Document>(
            "SELECT * FROM document
             WHERE business_id = $1 AND status <> 'deleted'
             ORDER BY created_at DESC",
        )
        .bind(business_id)
        .fetch_all(&db.pool)
        .await?;

        Ok(documents)
    }

    pub async fn patch(
        business_id: Uuid,
        id: Uuid,
        patch: DocumentPatch,
        db: &Database,
    ) -> Result<Self, AppError> {
        let document = sqlx::query_as::<_, Document>(
            "UPDATE document
             SET title = COALESCE($3, title),
                 labels = COALESCE($4, labels),
                 updated_at = now()
             WHERE id = $1 AND business_id = $2 AND status = 'active'
             RETURNING *",
        )
        .bind(id)
        .bind(business_id)
        .bind(patch.title)
        .bind(patch.labels)
        .fetch_optional(&db.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("active document {id}")))?;

        Ok(document)
    }

    /// User delete: freezes metadata and leaves the bytes for cleanup.
    pub async fn mark_deleted_pending(
        business_id: Uuid,
        id: Uuid,
        tx: &mut sqlx::PgTransaction<'_>,
    ) -> Result<Self, AppError> {
        sqlx::query_as::<_, Document>(
            "UPDATE document
             SET status = 'deleted_pending', deleted_at = now(), updated_at = now()
             WHERE id = $1 AND business_id = $2 AND status = 'active'
             RETURNING *",
        )
        .bind(id)
        .bind(business_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("active document {id}")))
    }

    /// Cleanup transition after object-store deletion has run.
    pub async fn mark_deleted(id: Uuid, db: &Database) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE document SET status = 'deleted', updated_at = now()
             WHERE id = $1 AND status = 'deleted_pending'",
        )
        .bind(id)
        .execute(&db.pool)
        .await?;

        Ok(())
    }
}
