use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::storage::db::Database;

/// Parser output, one row per logical page. Page numbers are 1-based and
/// contiguous within a version.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct DocumentPage {
    pub id: Uuid,
    pub version_id: Uuid,
    pub business_id: Uuid,
    pub page_number: i32,
    pub content: String,
    pub char_count: i32,
    pub created_at: DateTime<Utc>,
}

/// A page to persist; identity and timestamps are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewPage {
    pub page_number: i32,
    pub content: String,
}

impl DocumentPage {
    /// Replaces all pages for a version in one transaction. Delete-then-insert
    /// keeps re-runs after a partial failure idempotent.
    pub async fn replace_for_version(
        business_id: Uuid,
        version_id: Uuid,
        pages: &[NewPage],
        db: &Database,
    ) -> Result<(), AppError> {
        let mut tx = db.pool.begin().await?;

        sqlx::query("DELETE FROM document_page WHERE version_id = $1")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;

        for page in pages {
            sqlx::query(
                "INSERT INTO document_page
                     (id, version_id, business_id, page_number, content, char_count)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(Uuid::new_v4())
            .bind(version_id)
            .bind(business_id)
            .bind(page.page_number)
            .bind(&page.content)
            .bind(page.content.chars().count() as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_for_version(version_id: Uuid, db: &Database) -> Result<Vec<Self>, AppError> {
        let pages = sqlx::query_as::<_, DocumentPage>(
            "SELECT * FROM document_page WHERE version_id = $1 ORDER BY page_number",
        )
        .bind(version_id)
        .fetch_all(&db.pool)
        .await?;

        Ok(pages)
    }
}
