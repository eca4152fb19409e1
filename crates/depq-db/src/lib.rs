//! Job store for depq.
//!
//! Provides the [`JobStore`] trait (the optimistic claiming protocol), a
//! PostgreSQL implementation and an in-memory one with identical semantics.

pub mod encode;
pub mod error;
pub mod memory;
pub mod pg;
pub mod reports;
pub mod store;

pub use error::{DbError, DbResult};
pub use memory::MemoryJobStore;
pub use pg::PgJobStore;
pub use reports::{ErrorSummary, RuntimeMetric, StatusFilter, TimingSummary, TypeCount};
pub use store::{ClaimOutcome, ClaimRequest, JobStore, Lease};

pub use sqlx::PgPool;
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
