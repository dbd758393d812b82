//! PostgreSQL persistence for job leases.
//!
//! Exposes pool construction, start-up checks, the `job_leases` model and
//! repository, and [`PgLeaseStore`], the [`LeaseStore`] adapter used by the
//! worker harness.
//!
//! [`LeaseStore`]: clubops_core::leasing::LeaseStore

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

pub mod models;
pub mod repositories;
pub mod store;

pub use store::PgLeaseStore;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
///
/// Scheduled-job processes are short-lived and issue a handful of
/// statements, so the pool is kept small.
pub async fn create_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to confirm the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the embedded migrations in `db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}
