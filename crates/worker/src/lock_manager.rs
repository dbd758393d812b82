//! Acquire / contend / takeover / release state machine for job leases.
//!
//! The uncontended path is a single insert. When the insert conflicts, the
//! existing row is inspected: a valid lease rejects the caller, an expired
//! one is row-locked (without waiting) and rewritten to the caller. Losing
//! that race retries the whole path once, then gives up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clubops_core::error::CoreError;
use clubops_core::leasing::{
    lease_deadline, validate_job_name, validate_lease_duration, CreateOutcome, JobLease,
    LeaseStore, LeaseStoreError, RowLock, TakeoverOutcome, MAX_ACQUIRE_ATTEMPTS, UNKNOWN_HOLDER,
};
use clubops_core::types::Timestamp;

/// Result of [`LockManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// This process now holds the lease. `previous_holder` is set when an
    /// expired lease was taken over.
    Acquired {
        lease: JobLease,
        previous_holder: Option<String>,
    },
    /// Another holder has a valid lease (or won every race we entered).
    Rejected {
        holder: String,
        expires_at: Option<Timestamp>,
    },
}

/// Result of [`LockManager::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The row was already gone or belonged to another holder.
    NotHeld,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] LeaseStoreError),
}

/// Outcome of one pass through the contended path.
enum Contention {
    Acquired(AcquireOutcome),
    Valid(JobLease),
    /// The row changed under us; carries the last row we observed.
    LostRace(Option<JobLease>),
}

/// Lease operations on behalf of a single holder identity.
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    holder: String,
}

impl LockManager {
    pub fn new(store: Arc<dyn LeaseStore>, holder: impl Into<String>) -> Self {
        Self {
            store,
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Try to take the lease for `job_name` for `lease_duration`.
    pub async fn acquire(
        &self,
        job_name: &str,
        lease_duration: Duration,
    ) -> Result<AcquireOutcome, LockError> {
        validate_job_name(job_name)?;
        validate_lease_duration(lease_duration)?;

        let mut last_seen: Option<JobLease> = None;

        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            let now = Utc::now();
            let expires_at = lease_deadline(now, lease_duration)?;

            match self
                .store
                .try_create(job_name, &self.holder, now, expires_at)
                .await?
            {
                CreateOutcome::Created(lease) => {
                    tracing::debug!(job = job_name, holder = %self.holder, "Lease created");
                    return Ok(AcquireOutcome::Acquired {
                        lease,
                        previous_holder: None,
                    });
                }
                CreateOutcome::Conflict => {}
            }

            match self.contend(job_name, now, expires_at).await? {
                Contention::Acquired(outcome) => return Ok(outcome),
                Contention::Valid(lease) => {
                    tracing::debug!(
                        job = job_name,
                        holder = %lease.holder,
                        expires_at = %lease.expires_at,
                        "Lease held by another process",
                    );
                    return Ok(AcquireOutcome::Rejected {
                        holder: lease.holder,
                        expires_at: Some(lease.expires_at),
                    });
                }
                Contention::LostRace(observed) => {
                    tracing::debug!(job = job_name, attempt, "Lost lease race");
                    if observed.is_some() {
                        last_seen = observed;
                    }
                }
            }
        }

        tracing::info!(
            job = job_name,
            attempts = MAX_ACQUIRE_ATTEMPTS,
            "Giving up on contended lease",
        );
        Ok(match last_seen {
            Some(lease) => AcquireOutcome::Rejected {
                holder: lease.holder,
                expires_at: Some(lease.expires_at),
            },
            None => AcquireOutcome::Rejected {
                holder: UNKNOWN_HOLDER.to_string(),
                expires_at: None,
            },
        })
    }

    /// One pass through the contended path after `try_create` conflicted.
    async fn contend(
        &self,
        job_name: &str,
        now: Timestamp,
        expires_at: Timestamp,
    ) -> Result<Contention, LeaseStoreError> {
        let Some(current) = self.store.get(job_name).await? else {
            return Ok(Contention::LostRace(None));
        };
        if !current.is_expired_at(now) {
            return Ok(Contention::Valid(current));
        }

        let locked = match self.store.get_for_update(job_name).await? {
            RowLock::Locked(Some(lease)) => lease,
            RowLock::Locked(None) | RowLock::Busy => {
                return Ok(Contention::LostRace(Some(current)));
            }
        };
        // Someone may have taken it over between the two reads.
        if !locked.is_expired_at(now) {
            return Ok(Contention::Valid(locked));
        }

        match self
            .store
            .takeover(&locked, &self.holder, now, expires_at)
            .await?
        {
            TakeoverOutcome::Success(lease) => {
                tracing::info!(
                    job = job_name,
                    holder = %self.holder,
                    previous_holder = %locked.holder,
                    expired_at = %locked.expires_at,
                    "Took over expired lease",
                );
                Ok(Contention::Acquired(AcquireOutcome::Acquired {
                    lease,
                    previous_holder: Some(locked.holder),
                }))
            }
            TakeoverOutcome::Gone => Ok(Contention::LostRace(Some(locked))),
        }
    }

    /// Release the lease for `job_name` if this holder still owns it.
    pub async fn release(&self, job_name: &str) -> Result<ReleaseOutcome, LeaseStoreError> {
        let deleted = self.store.delete_if_holder(job_name, &self.holder).await?;
        Ok(if deleted > 0 {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::NotHeld
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
