//! Job lease model, limits, validation, and the [`LeaseStore`] port.
//!
//! A lease is a time-bounded exclusive claim on a named scheduled job. At
//! most one lease row exists per job name; deleting the row is how a lease
//! is released. Every write goes through the atomic primitives on
//! [`LeaseStore`], each of which reports races as explicit result variants
//! rather than errors.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::CoreError;
use crate::types::Timestamp;

pub use memory::{MemoryLeaseStore, StoreOp};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Maximum length of a job name (matches the conventions of the scheduler
/// entry points, which use snake_case identifiers).
pub const MAX_JOB_NAME_LEN: usize = 100;

/// Maximum length of a holder identity string.
pub const MAX_HOLDER_LEN: usize = 255;

/// Shortest lease a job may declare.
pub const MIN_LEASE_DURATION: Duration = Duration::from_secs(1);

/// Longest lease a job may declare (24 hours).
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Passes through the acquire path before giving up: the initial attempt
/// plus one retry after losing a takeover race.
pub const MAX_ACQUIRE_ATTEMPTS: u32 = 2;

/// Holder reported when a contended acquire gives up without ever
/// observing the competing row.
pub const UNKNOWN_HOLDER: &str = "unknown";

// ---------------------------------------------------------------------------
// JobLease
// ---------------------------------------------------------------------------

/// A single lease row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobLease {
    pub job_name: String,
    pub holder: String,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl JobLease {
    /// A lease whose deadline is at or before `now` may be taken over by
    /// any process.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }

    /// Returns `true` if this lease belongs to `holder`.
    pub fn is_held_by(&self, holder: &str) -> bool {
        self.holder == holder
    }
}

// ---------------------------------------------------------------------------
// Store outcomes
// ---------------------------------------------------------------------------

/// Result of [`LeaseStore::try_create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The row was inserted; the caller now holds the lease.
    Created(JobLease),
    /// A row for this job name already exists.
    Conflict,
}

/// Result of [`LeaseStore::get_for_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowLock {
    /// No other transaction held the row lock. `None` means no row exists.
    Locked(Option<JobLease>),
    /// Another transaction holds the row lock; the read failed fast.
    Busy,
}

/// Result of [`LeaseStore::takeover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TakeoverOutcome {
    /// The row was rewritten to the new holder.
    Success(JobLease),
    /// The row was deleted or rewritten by someone else since it was read.
    Gone,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures talking to the lease store.
///
/// Races (conflicts, vanished rows, busy row locks) are never errors; they
/// are reported through the outcome enums above.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseStoreError {
    /// The store could not be reached (connection refused, pool exhausted).
    #[error("Lease store unavailable: {0}")]
    Unavailable(String),

    /// The store was reachable but the statement failed.
    #[error("Lease store query failed: {0}")]
    Query(String),
}

// ---------------------------------------------------------------------------
// LeaseStore port
// ---------------------------------------------------------------------------

/// Durable record of at most one lease per job name.
///
/// All operations must be atomic with respect to concurrent callers in
/// other processes.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Insert a new lease, relying on the uniqueness of `job_name`.
    async fn try_create(
        &self,
        job_name: &str,
        holder: &str,
        acquired_at: Timestamp,
        expires_at: Timestamp,
    ) -> Result<CreateOutcome, LeaseStoreError>;

    /// Plain read of the current lease, if any.
    async fn get(&self, job_name: &str) -> Result<Option<JobLease>, LeaseStoreError>;

    /// Fail-fast check of the row lock: read the current lease, reporting
    /// [`RowLock::Busy`] instead of waiting if a concurrent transaction holds
    /// the row. The lock is released before this returns;
    /// [`LeaseStore::takeover`] locks the row again to rewrite it.
    async fn get_for_update(&self, job_name: &str) -> Result<RowLock, LeaseStoreError>;

    /// Rewrite the row previously observed as `expected` to `new_holder`.
    ///
    /// Succeeds only if the row still carries the holder and deadline of
    /// `expected`.
    async fn takeover(
        &self,
        expected: &JobLease,
        new_holder: &str,
        acquired_at: Timestamp,
        expires_at: Timestamp,
    ) -> Result<TakeoverOutcome, LeaseStoreError>;

    /// Delete the lease only if it still belongs to `holder`. Returns the
    /// number of rows deleted (0 or 1).
    async fn delete_if_holder(&self, job_name: &str, holder: &str) -> Result<u64, LeaseStoreError>;

    /// Delete every lease, for any job, whose deadline is at or before
    /// `before`. Returns the number of rows deleted.
    async fn sweep_expired(&self, before: Timestamp) -> Result<u64, LeaseStoreError>;

    /// All current leases, ordered by job name.
    async fn list(&self) -> Result<Vec<JobLease>, LeaseStoreError>;
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Job names are ASCII identifiers: alphanumerics plus `_`, `-` and `.`.
pub fn validate_job_name(job_name: &str) -> Result<(), CoreError> {
    if job_name.is_empty() {
        return Err(CoreError::Validation("Job name must not be empty".into()));
    }
    if job_name.len() > MAX_JOB_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Job name must be at most {MAX_JOB_NAME_LEN} characters, got {}",
            job_name.len()
        )));
    }
    if let Some(bad) = job_name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(CoreError::Validation(format!(
            "Job name '{job_name}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

/// Holder identities are opaque but must be non-empty and fit the column.
pub fn validate_holder(holder: &str) -> Result<(), CoreError> {
    if holder.trim().is_empty() {
        return Err(CoreError::Validation(
            "Lease holder must not be empty".into(),
        ));
    }
    if holder.len() > MAX_HOLDER_LEN {
        return Err(CoreError::Validation(format!(
            "Lease holder must be at most {MAX_HOLDER_LEN} characters, got {}",
            holder.len()
        )));
    }
    Ok(())
}

/// Validate a job's declared lease duration.
pub fn validate_lease_duration(duration: Duration) -> Result<(), CoreError> {
    if duration < MIN_LEASE_DURATION {
        return Err(CoreError::Validation(format!(
            "Lease duration must be at least {}s, got {}ms",
            MIN_LEASE_DURATION.as_secs(),
            duration.as_millis()
        )));
    }
    if duration > MAX_LEASE_DURATION {
        return Err(CoreError::Validation(format!(
            "Lease duration must be at most {}s, got {}s",
            MAX_LEASE_DURATION.as_secs(),
            duration.as_secs()
        )));
    }
    Ok(())
}

/// Compute `acquired_at + lease_duration`.
pub fn lease_deadline(acquired_at: Timestamp, duration: Duration) -> Result<Timestamp, CoreError> {
    let delta = chrono::Duration::from_std(duration)
        .map_err(|e| CoreError::Validation(format!("Lease duration out of range: {e}")))?;
    acquired_at
        .checked_add_signed(delta)
        .ok_or_else(|| CoreError::Validation("Lease deadline overflows".into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn lease_expiring(expires_at: Timestamp) -> JobLease {
        JobLease {
            job_name: "weekly_digest".into(),
            holder: "proc-1".into(),
            acquired_at: expires_at - chrono::Duration::minutes(10),
            expires_at,
        }
    }

    #[test]
    fn test_valid_job_names() {
        assert!(validate_job_name("purge_old_records").is_ok());
        assert!(validate_job_name("weekly-digest.v2").is_ok());
        assert!(validate_job_name("a").is_ok());
    }

    #[test]
    fn test_invalid_job_names() {
        assert!(validate_job_name("").is_err());
        assert!(validate_job_name("has space").is_err());
        assert!(validate_job_name("semi;colon").is_err());
        assert!(validate_job_name(&"x".repeat(MAX_JOB_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_job_name_at_max_length() {
        assert!(validate_job_name(&"x".repeat(MAX_JOB_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_holder_validation() {
        assert!(validate_holder("web-7f9c:1:0a1b2c3d").is_ok());
        assert!(validate_holder("   ").is_err());
        assert!(validate_holder(&"h".repeat(MAX_HOLDER_LEN + 1)).is_err());
    }

    #[test]
    fn test_lease_duration_bounds() {
        assert!(validate_lease_duration(Duration::from_secs(1)).is_ok());
        assert!(validate_lease_duration(Duration::from_secs(600)).is_ok());
        assert!(validate_lease_duration(MAX_LEASE_DURATION).is_ok());
        assert!(validate_lease_duration(Duration::from_millis(999)).is_err());
        assert!(validate_lease_duration(MAX_LEASE_DURATION + Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_lease_deadline_adds_duration() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let deadline = lease_deadline(start, Duration::from_secs(600)).unwrap();
        assert_eq!(
            deadline,
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 10, 0).unwrap()
        );
    }

    #[test]
    fn test_lease_expired_at_deadline() {
        let deadline = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let lease = lease_expiring(deadline);
        assert!(lease.is_expired_at(deadline));
        assert!(lease.is_expired_at(deadline + chrono::Duration::seconds(1)));
        assert!(!lease.is_expired_at(deadline - chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_is_held_by() {
        let lease = lease_expiring(Utc::now());
        assert!(lease.is_held_by("proc-1"));
        assert!(!lease.is_held_by("proc-2"));
    }
}
