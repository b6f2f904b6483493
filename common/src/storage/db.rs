use std::ops::Deref;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::migrate::Migrator;

use crate::error::AppError;

/// Bundled schema migrations, applied by `docpipe migrate` and verified by
/// `docpipe verify-db`.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    /// Connects to the Postgres-compatible DSN from configuration.
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn apply_migrations(&self) -> Result<(), AppError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Connectivity and schema check: the pool answers and every bundled
    /// migration has been applied.
    pub async fn verify(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;

        let applied: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM _sqlx_migrations ORDER BY version")
                .fetch_all(&self.pool)
                .await?;
        for migration in MIGRATOR.iter() {
            if !applied.contains(&migration.version) {
                return Err(AppError::Validation(format!(
                    "migration {} ({}) has not been applied; run `docpipe migrate`",
                    migration.version, migration.description
                )));
            }
        }

        Ok(())
    }
}

impl Deref for Database {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}
