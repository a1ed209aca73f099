//! Database layer for BuildTrack.
//!
//! Provides the PostgreSQL build repository and the build-started
//! notification listener.

pub mod error;
pub mod notify;
pub mod repo;

pub use error::{DbError, DbResult};
pub use notify::{BUILD_STARTED_CHANNEL, BuildNotifier};
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
