//! [`LeaseStore`] backed by the `job_leases` table.

use async_trait::async_trait;
use clubops_core::leasing::{
    CreateOutcome, JobLease, LeaseStore, LeaseStoreError, RowLock, TakeoverOutcome,
};
use clubops_core::types::Timestamp;

use crate::repositories::job_lease_repo::{is_lock_not_available, JobLeaseRepo};
use crate::DbPool;

/// PostgreSQL lease store.
///
/// Cloning is cheap; clones share the underlying pool.
#[derive(Debug, Clone)]
pub struct PgLeaseStore {
    pool: DbPool,
}

impl PgLeaseStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Classify a sqlx error as either connectivity loss or a failed statement.
pub fn classify_sqlx_error(err: sqlx::Error) -> LeaseStoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => LeaseStoreError::Unavailable(err.to_string()),
        other => {
            tracing::error!(error = %other, "Lease store query failed");
            LeaseStoreError::Query(other.to_string())
        }
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn try_create(
        &self,
        job_name: &str,
        holder: &str,
        acquired_at: Timestamp,
        expires_at: Timestamp,
    ) -> Result<CreateOutcome, LeaseStoreError> {
        let inserted = JobLeaseRepo::insert(&self.pool, job_name, holder, acquired_at, expires_at)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(match inserted {
            Some(row) => CreateOutcome::Created(row.into()),
            None => CreateOutcome::Conflict,
        })
    }

    async fn get(&self, job_name: &str) -> Result<Option<JobLease>, LeaseStoreError> {
        JobLeaseRepo::find_by_job(&self.pool, job_name)
            .await
            .map(|row| row.map(JobLease::from))
            .map_err(classify_sqlx_error)
    }

    async fn get_for_update(&self, job_name: &str) -> Result<RowLock, LeaseStoreError> {
        match JobLeaseRepo::find_by_job_for_update(&self.pool, job_name).await {
            Ok(row) => Ok(RowLock::Locked(row.map(JobLease::from))),
            Err(e) if is_lock_not_available(&e) => {
                tracing::debug!(
                    job = job_name,
                    "Lease row locked by a concurrent transaction"
                );
                Ok(RowLock::Busy)
            }
            Err(e) => Err(classify_sqlx_error(e)),
        }
    }

    async fn takeover(
        &self,
        expected: &JobLease,
        new_holder: &str,
        acquired_at: Timestamp,
        expires_at: Timestamp,
    ) -> Result<TakeoverOutcome, LeaseStoreError> {
        let result = JobLeaseRepo::take_over(
            &self.pool,
            &expected.job_name,
            &expected.holder,
            expected.expires_at,
            new_holder,
            acquired_at,
            expires_at,
        )
        .await;
        match result {
            Ok(Some(row)) => Ok(TakeoverOutcome::Success(row.into())),
            Ok(None) => Ok(TakeoverOutcome::Gone),
            Err(e) if is_lock_not_available(&e) => Ok(TakeoverOutcome::Gone),
            Err(e) => Err(classify_sqlx_error(e)),
        }
    }

    async fn delete_if_holder(&self, job_name: &str, holder: &str) -> Result<u64, LeaseStoreError> {
        JobLeaseRepo::delete_if_holder(&self.pool, job_name, holder)
            .await
            .map_err(classify_sqlx_error)
    }

    async fn sweep_expired(&self, before: Timestamp) -> Result<u64, LeaseStoreError> {
        JobLeaseRepo::delete_expired(&self.pool, before)
            .await
            .map_err(classify_sqlx_error)
    }

    async fn list(&self) -> Result<Vec<JobLease>, LeaseStoreError> {
        JobLeaseRepo::list(&self.pool)
            .await
            .map(|rows| rows.into_iter().map(JobLease::from).collect())
            .map_err(classify_sqlx_error)
    }
}
