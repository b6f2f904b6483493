use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::storage::db::Database;

/// Membership record from the auth collaborator. Referenced here because
/// the business id it establishes is the mandatory partition key on every
/// ingestion entity.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct BusinessMember {
    pub id: Uuid,
    pub business_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

impl BusinessMember {
    pub async fn is_member(business_id: Uuid, user_id: Uuid, db: &Database) -> Result<bool, AppError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM business_member WHERE business_id = $1 AND user_id = $2)",
        )
        .bind(business_id)
        .bind(user_id)
        .fetch_one(&db.pool)
        .await?;

        Ok(exists)
    }

    /// Reverse lookup used by the session layer: all businesses for a user.
    pub async fn businesses_for_user(user_id: Uuid, db: &Database) -> Result<Vec<Uuid>, AppError> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT business_id FROM business_member WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&db.pool)
                .await?;

        Ok(ids)
    }
}
