//! Repository for the `job_leases` table.
//!
//! Each statement is a single atomic operation; races with other worker
//! processes surface as `None` / zero-row results rather than errors.

use clubops_core::types::Timestamp;
use sqlx::PgPool;

use crate::models::job_lease::JobLeaseRow;

/// Column list for `job_leases` queries.
const COLUMNS: &str = "id, job_name, holder, acquired_at, expires_at";

/// Upper bound on how long a takeover waits for a rival's row lock.
const TAKEOVER_LOCK_TIMEOUT_SQL: &str = "SET LOCAL lock_timeout = '5s'";

/// Row lock taken at the start of a takeover transaction.
const LOCK_ROW_SQL: &str = "SELECT holder FROM job_leases WHERE job_name = $1 FOR UPDATE";

/// PostgreSQL error code raised by `NOWAIT` or `lock_timeout` when the row
/// lock is taken.
pub const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Returns `true` if `err` is a row-lock failure (`NOWAIT` or lock timeout).
pub fn is_lock_not_available(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE),
        _ => false,
    }
}

/// Provides the atomic lease primitives.
pub struct JobLeaseRepo;

impl JobLeaseRepo {
    /// Insert a lease for `job_name`.
    ///
    /// Uses `INSERT ... ON CONFLICT DO NOTHING` against the unique
    /// constraint on `job_name`. Returns `None` if a row already exists.
    pub async fn insert(
        pool: &PgPool,
        job_name: &str,
        holder: &str,
        acquired_at: Timestamp,
        expires_at: Timestamp,
    ) -> Result<Option<JobLeaseRow>, sqlx::Error> {
        let query = format!(
            "INSERT INTO job_leases (job_name, holder, acquired_at, expires_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (job_name) DO NOTHING \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobLeaseRow>(&query)
            .bind(job_name)
            .bind(holder)
            .bind(acquired_at)
            .bind(expires_at)
            .fetch_optional(pool)
            .await
    }

    /// Get the lease for a job, or `None` if the job is unlocked.
    pub async fn find_by_job(
        pool: &PgPool,
        job_name: &str,
    ) -> Result<Option<JobLeaseRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM job_leases WHERE job_name = $1");
        sqlx::query_as::<_, JobLeaseRow>(&query)
            .bind(job_name)
            .fetch_optional(pool)
            .await
    }

    /// Fail-fast check that no other transaction holds the row lock.
    ///
    /// Reads the lease under `FOR UPDATE NOWAIT` and commits straight away,
    /// so the lock is not held on return. Fails with SQLSTATE `55P03` (see
    /// [`is_lock_not_available`]) when another transaction holds the row.
    /// [`JobLeaseRepo::take_over`] takes the lock again for the rewrite.
    pub async fn find_by_job_for_update(
        pool: &PgPool,
        job_name: &str,
    ) -> Result<Option<JobLeaseRow>, sqlx::Error> {
        let query =
            format!("SELECT {COLUMNS} FROM job_leases WHERE job_name = $1 FOR UPDATE NOWAIT");
        let mut tx = pool.begin().await?;
        let row = sqlx::query_as::<_, JobLeaseRow>(&query)
            .bind(job_name)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row)
    }

    /// Rewrite an observed lease to a new holder.
    ///
    /// Runs in one transaction: row-lock, then update only if the row still
    /// carries `expected_holder` and `expected_expires_at`. The lock waits
    /// for a concurrent fail-fast read or takeover to finish, bounded by a
    /// transaction-local `lock_timeout` (SQLSTATE `55P03` when exceeded).
    /// Returns `None` if the row vanished or was rewritten in between.
    #[allow(clippy::too_many_arguments)]
    pub async fn take_over(
        pool: &PgPool,
        job_name: &str,
        expected_holder: &str,
        expected_expires_at: Timestamp,
        new_holder: &str,
        acquired_at: Timestamp,
        expires_at: Timestamp,
    ) -> Result<Option<JobLeaseRow>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        sqlx::query(TAKEOVER_LOCK_TIMEOUT_SQL)
            .execute(&mut *tx)
            .await?;

        let locked: Option<(String,)> = sqlx::query_as(LOCK_ROW_SQL)
            .bind(job_name)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        let query = format!(
            "UPDATE job_leases SET holder = $2, acquired_at = $3, expires_at = $4 \
             WHERE job_name = $1 AND holder = $5 AND expires_at = $6 \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobLeaseRow>(&query)
            .bind(job_name)
            .bind(new_holder)
            .bind(acquired_at)
            .bind(expires_at)
            .bind(expected_holder)
            .bind(expected_expires_at)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row)
    }

    /// Delete a lease only if `holder` still owns it.
    ///
    /// Returns the number of rows deleted (0 or 1).
    pub async fn delete_if_holder(
        pool: &PgPool,
        job_name: &str,
        holder: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM job_leases WHERE job_name = $1 AND holder = $2")
            .bind(job_name)
            .bind(holder)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete every lease whose deadline is at or before `before`.
    /// Returns the number of leases removed.
    pub async fn delete_expired(pool: &PgPool, before: Timestamp) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM job_leases WHERE expires_at <= $1")
            .bind(before)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// List all leases ordered by job name.
    pub async fn list(pool: &PgPool) -> Result<Vec<JobLeaseRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM job_leases ORDER BY job_name");
        sqlx::query_as::<_, JobLeaseRow>(&query)
            .fetch_all(pool)
            .await
    }
}
