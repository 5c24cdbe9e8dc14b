//! Database migration management.
//!
//! Migrations are embedded at compile time from the `migrations/` directory.

use crate::error::DbError;
use crate::pool::DbPool;

/// Run all pending database migrations.
///
/// Each migration is run in order based on its filename prefix.
///
/// # Example
///
/// ```rust,ignore
/// use clipper_db::{run_migrations, DbPool};
///
/// let pool = DbPool::connect("postgres://localhost/clipper").await?;
/// run_migrations(&pool).await?;
/// ```
///
/// # Errors
///
/// Returns `DbError::MigrationFailed` if any migration fails to apply.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    tracing::info!("Running database migrations...");

    sqlx::migrate!("./migrations")
        .run(pool.inner())
        .await
        .map_err(DbError::MigrationFailed)?;

    tracing::info!("Migrations completed successfully");
    Ok(())
}
