//! In-process [`LeaseStore`] used by tests and local tooling.
//!
//! Mirrors the semantics of the PostgreSQL store: one row per job name,
//! compare-and-swap takeover, holder-guarded delete. Every call is recorded
//! as a [`StoreOp`] so tests can assert which operations touched which job.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{CreateOutcome, JobLease, LeaseStore, LeaseStoreError, RowLock, TakeoverOutcome};
use crate::types::Timestamp;

/// A recorded call against a [`MemoryLeaseStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    TryCreate { job_name: String },
    Get { job_name: String },
    GetForUpdate { job_name: String },
    Takeover { job_name: String },
    DeleteIfHolder { job_name: String },
    SweepExpired,
    List,
}

impl StoreOp {
    /// The job this operation targeted, or `None` for job-agnostic calls.
    pub fn job_name(&self) -> Option<&str> {
        match self {
            Self::TryCreate { job_name }
            | Self::Get { job_name }
            | Self::GetForUpdate { job_name }
            | Self::Takeover { job_name }
            | Self::DeleteIfHolder { job_name } => Some(job_name),
            Self::SweepExpired | Self::List => None,
        }
    }

    /// Returns `true` for operations that write or row-lock.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::TryCreate { .. }
                | Self::GetForUpdate { .. }
                | Self::Takeover { .. }
                | Self::DeleteIfHolder { .. }
                | Self::SweepExpired
        )
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<String, JobLease>,
    /// Remaining number of row-lock attempts that should report busy.
    busy_rows: HashMap<String, u32>,
    ops: Vec<StoreOp>,
    unavailable: bool,
}

impl MemoryState {
    fn check_available(&self) -> Result<(), LeaseStoreError> {
        if self.unavailable {
            return Err(LeaseStoreError::Unavailable(
                "memory lease store marked unavailable".into(),
            ));
        }
        Ok(())
    }

    /// Consume one busy tick for `job_name`, returning `true` if the row is
    /// currently locked by a simulated concurrent transaction.
    fn take_busy(&mut self, job_name: &str) -> bool {
        match self.busy_rows.get_mut(job_name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Thread-safe in-memory lease table.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    state: Mutex<MemoryState>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a row directly, bypassing the uniqueness check. Not recorded.
    pub fn insert(&self, lease: JobLease) {
        self.state().rows.insert(lease.job_name.clone(), lease);
    }

    /// Snapshot of the current rows, ordered by job name.
    pub fn rows(&self) -> Vec<JobLease> {
        self.state().rows.values().cloned().collect()
    }

    /// Current row for `job_name`. Not recorded.
    pub fn row(&self, job_name: &str) -> Option<JobLease> {
        self.state().rows.get(job_name).cloned()
    }

    /// Every operation recorded so far, in call order.
    pub fn ops(&self) -> Vec<StoreOp> {
        self.state().ops.clone()
    }

    /// Operations that targeted `job_name`.
    pub fn ops_for(&self, job_name: &str) -> Vec<StoreOp> {
        self.state()
            .ops
            .iter()
            .filter(|op| op.job_name() == Some(job_name))
            .cloned()
            .collect()
    }

    /// Make every subsequent call fail with [`LeaseStoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Simulate a concurrent transaction holding the row lock for the next
    /// `attempts` row-lock attempts on `job_name`.
    pub fn hold_row_lock(&self, job_name: &str, attempts: u32) {
        self.state()
            .busy_rows
            .insert(job_name.to_string(), attempts);
    }

    fn record(&self, op: StoreOp) -> MutexGuard<'_, MemoryState> {
        let mut state = self.state();
        state.ops.push(op);
        state
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_create(
        &self,
        job_name: &str,
        holder: &str,
        acquired_at: Timestamp,
        expires_at: Timestamp,
    ) -> Result<CreateOutcome, LeaseStoreError> {
        let mut state = self.record(StoreOp::TryCreate {
            job_name: job_name.to_string(),
        });
        state.check_available()?;

        if state.rows.contains_key(job_name) {
            return Ok(CreateOutcome::Conflict);
        }
        let lease = JobLease {
            job_name: job_name.to_string(),
            holder: holder.to_string(),
            acquired_at,
            expires_at,
        };
        state.rows.insert(job_name.to_string(), lease.clone());
        Ok(CreateOutcome::Created(lease))
    }

    async fn get(&self, job_name: &str) -> Result<Option<JobLease>, LeaseStoreError> {
        let state = self.record(StoreOp::Get {
            job_name: job_name.to_string(),
        });
        state.check_available()?;
        Ok(state.rows.get(job_name).cloned())
    }

    async fn get_for_update(&self, job_name: &str) -> Result<RowLock, LeaseStoreError> {
        let mut state = self.record(StoreOp::GetForUpdate {
            job_name: job_name.to_string(),
        });
        state.check_available()?;

        if state.take_busy(job_name) {
            return Ok(RowLock::Busy);
        }
        Ok(RowLock::Locked(state.rows.get(job_name).cloned()))
    }

    async fn takeover(
        &self,
        expected: &JobLease,
        new_holder: &str,
        acquired_at: Timestamp,
        expires_at: Timestamp,
    ) -> Result<TakeoverOutcome, LeaseStoreError> {
        let mut state = self.record(StoreOp::Takeover {
            job_name: expected.job_name.clone(),
        });
        state.check_available()?;

        if state.take_busy(&expected.job_name) {
            return Ok(TakeoverOutcome::Gone);
        }
        match state.rows.get_mut(&expected.job_name) {
            Some(row) if row.holder == expected.holder && row.expires_at == expected.expires_at => {
                row.holder = new_holder.to_string();
                row.acquired_at = acquired_at;
                row.expires_at = expires_at;
                Ok(TakeoverOutcome::Success(row.clone()))
            }
            _ => Ok(TakeoverOutcome::Gone),
        }
    }

    async fn delete_if_holder(&self, job_name: &str, holder: &str) -> Result<u64, LeaseStoreError> {
        let mut state = self.record(StoreOp::DeleteIfHolder {
            job_name: job_name.to_string(),
        });
        state.check_available()?;

        let owned = state
            .rows
            .get(job_name)
            .is_some_and(|row| row.holder == holder);
        if !owned {
            return Ok(0);
        }
        state.rows.remove(job_name);
        Ok(1)
    }

    async fn sweep_expired(&self, before: Timestamp) -> Result<u64, LeaseStoreError> {
        let mut state = self.record(StoreOp::SweepExpired);
        state.check_available()?;

        let count_before = state.rows.len();
        state.rows.retain(|_, row| !row.is_expired_at(before));
        Ok((count_before - state.rows.len()) as u64)
    }

    async fn list(&self) -> Result<Vec<JobLease>, LeaseStoreError> {
        let state = self.record(StoreOp::List);
        state.check_available()?;
        Ok(state.rows.values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};

    fn lease(job_name: &str, holder: &str, expires_in: Duration) -> JobLease {
        let now = Utc::now();
        JobLease {
            job_name: job_name.into(),
            holder: holder.into(),
            acquired_at: now - Duration::minutes(1),
            expires_at: now + expires_in,
        }
    }

    #[tokio::test]
    async fn test_try_create_conflicts_on_existing_row() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        let later = now + Duration::minutes(10);

        let first = store
            .try_create("purge", "proc-1", now, later)
            .await
            .unwrap();
        assert_matches!(first, CreateOutcome::Created(ref l) if l.holder == "proc-1");

        let second = store
            .try_create("purge", "proc-2", now, later)
            .await
            .unwrap();
        assert_eq!(second, CreateOutcome::Conflict);
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_takeover_requires_matching_row() {
        let store = MemoryLeaseStore::new();
        let stale = lease("digest", "proc-dead", Duration::hours(-1));
        store.insert(stale.clone());

        let mut outdated = stale.clone();
        outdated.holder = "someone-else".into();
        let now = Utc::now();
        let gone = store
            .takeover(&outdated, "proc-3", now, now + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(gone, TakeoverOutcome::Gone);

        let taken = store
            .takeover(&stale, "proc-3", now, now + Duration::minutes(5))
            .await
            .unwrap();
        assert_matches!(taken, TakeoverOutcome::Success(ref l) if l.holder == "proc-3");
        assert_eq!(store.row("digest").unwrap().holder, "proc-3");
    }

    #[tokio::test]
    async fn test_delete_if_holder_ignores_other_holders() {
        let store = MemoryLeaseStore::new();
        store.insert(lease("purge", "proc-1", Duration::minutes(10)));

        assert_eq!(store.delete_if_holder("purge", "proc-2").await.unwrap(), 0);
        assert!(store.row("purge").is_some());
        assert_eq!(store.delete_if_holder("purge", "proc-1").await.unwrap(), 1);
        assert!(store.row("purge").is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_rows() {
        let store = MemoryLeaseStore::new();
        store.insert(lease("a", "proc-1", Duration::hours(-1)));
        store.insert(lease("b", "proc-2", Duration::minutes(10)));
        store.insert(lease("c", "proc-3", Duration::seconds(-1)));

        let swept = store.sweep_expired(Utc::now()).await.unwrap();
        assert_eq!(swept, 2);
        let remaining: Vec<_> = store.rows().into_iter().map(|l| l.job_name).collect();
        assert_eq!(remaining, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_busy_row_lock_fails_fast_then_clears() {
        let store = MemoryLeaseStore::new();
        store.insert(lease("purge", "proc-1", Duration::minutes(10)));
        store.hold_row_lock("purge", 1);

        assert_eq!(store.get_for_update("purge").await.unwrap(), RowLock::Busy);
        assert_matches!(
            store.get_for_update("purge").await.unwrap(),
            RowLock::Locked(Some(_))
        );
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryLeaseStore::new();
        store.set_unavailable(true);
        assert_matches!(
            store.sweep_expired(Utc::now()).await,
            Err(LeaseStoreError::Unavailable(_))
        );
    }

    #[tokio::test]
    async fn test_ops_are_recorded_per_job() {
        let store = MemoryLeaseStore::new();
        let _ = store.get("a").await;
        let _ = store.sweep_expired(Utc::now()).await;
        let _ = store.delete_if_holder("b", "proc-1").await;

        assert_eq!(store.ops().len(), 3);
        assert_eq!(
            store.ops_for("a"),
            vec![StoreOp::Get {
                job_name: "a".into()
            }]
        );
        assert!(store.ops_for("b")[0].is_mutating());
    }
}
