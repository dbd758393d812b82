//! End-to-end lease locking against PostgreSQL.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use clubops_core::leasing::LeaseStore;
use clubops_db::repositories::JobLeaseRepo;
use clubops_db::PgLeaseStore;
use clubops_worker::job::{Job, JobContext, JobOptions};
use clubops_worker::lock_manager::{AcquireOutcome, LockManager, ReleaseOutcome};
use clubops_worker::runner::{JobRunner, RunError, RunOutcome};

const LEASE: Duration = Duration::from_secs(600);

struct CountingJob {
    name: &'static str,
    fail: bool,
    calls: AtomicUsize,
}

impl CountingJob {
    fn new(name: &'static str, fail: bool) -> Self {
        Self {
            name,
            fail,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Job for CountingJob {
    fn name(&self) -> &str {
        self.name
    }

    fn lease_duration(&self) -> Duration {
        LEASE
    }

    async fn execute(&self, _ctx: &JobContext) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("export target unreachable");
        }
        Ok(())
    }
}

fn store(pool: &PgPool) -> Arc<dyn LeaseStore> {
    Arc::new(PgLeaseStore::new(pool.clone()))
}

async fn lease_rows(pool: &PgPool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM job_leases")
        .fetch_one(pool)
        .await
        .unwrap()
}

/// The stored row for `job_name`, serialized with every column.
async fn row_snapshot(pool: &PgPool, job_name: &str) -> serde_json::Value {
    let row = JobLeaseRepo::find_by_job(pool, job_name)
        .await
        .unwrap()
        .expect("lease row should exist");
    serde_json::to_value(&row).unwrap()
}

async fn seed_expired(pool: &PgPool, job_name: &str, holder: &str) {
    let now = Utc::now();
    JobLeaseRepo::insert(
        pool,
        job_name,
        holder,
        now - chrono::Duration::hours(2),
        now - chrono::Duration::hours(1),
    )
    .await
    .unwrap()
    .expect("seed row");
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_run_acquires_and_releases(pool: PgPool) {
    let job = CountingJob::new("purge_old_records", false);

    let outcome = JobRunner::new(store(&pool), "proc-1")
        .run(&job, JobOptions::default())
        .await
        .unwrap();

    assert_matches!(outcome, RunOutcome::Success { .. });
    assert_eq!(job.calls.load(Ordering::SeqCst), 1);
    assert_eq!(lease_rows(&pool).await, 0);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_second_holder_skips_while_lease_is_valid(pool: PgPool) {
    let holder = LockManager::new(store(&pool), "proc-1");
    assert_matches!(
        holder.acquire("purge_old_records", LEASE).await.unwrap(),
        AcquireOutcome::Acquired { .. }
    );

    let job = CountingJob::new("purge_old_records", false);
    let outcome = JobRunner::new(store(&pool), "proc-2")
        .run(&job, JobOptions::default())
        .await
        .unwrap();

    assert_matches!(outcome, RunOutcome::Skipped { ref holder } if holder == "proc-1");
    assert_eq!(job.calls.load(Ordering::SeqCst), 0);
    assert_eq!(lease_rows(&pool).await, 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_failed_job_leaves_no_lease(pool: PgPool) {
    let job = CountingJob::new("nightly_export", true);

    let err = JobRunner::new(store(&pool), "proc-1")
        .run(&job, JobOptions::default())
        .await
        .unwrap_err();

    assert_matches!(err, RunError::Job { .. });
    assert_eq!(lease_rows(&pool).await, 0);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_dry_run_leaves_foreign_lease_untouched(pool: PgPool) {
    let owner = LockManager::new(store(&pool), "proc-1");
    assert_matches!(
        owner.acquire("nightly_export", LEASE).await.unwrap(),
        AcquireOutcome::Acquired { .. }
    );
    let before = row_snapshot(&pool, "nightly_export").await;

    let job = CountingJob::new("nightly_export", false);
    let options = JobOptions {
        dry_run: true,
        ..JobOptions::default()
    };
    let outcome = JobRunner::new(store(&pool), "proc-2")
        .run(&job, options)
        .await
        .unwrap();

    assert_matches!(outcome, RunOutcome::Success { dry_run: true, .. });
    assert_eq!(job.calls.load(Ordering::SeqCst), 1);
    assert_eq!(row_snapshot(&pool, "nightly_export").await, before);
    assert_eq!(lease_rows(&pool).await, 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_force_runs_beside_foreign_lease(pool: PgPool) {
    let owner = LockManager::new(store(&pool), "proc-1");
    assert_matches!(
        owner.acquire("nightly_export", LEASE).await.unwrap(),
        AcquireOutcome::Acquired { .. }
    );
    let before = row_snapshot(&pool, "nightly_export").await;

    let job = CountingJob::new("nightly_export", false);
    let options = JobOptions {
        force: true,
        ..JobOptions::default()
    };
    let outcome = JobRunner::new(store(&pool), "proc-2")
        .run(&job, options)
        .await
        .unwrap();

    assert_matches!(outcome, RunOutcome::Success { dry_run: false, .. });
    assert_eq!(job.calls.load(Ordering::SeqCst), 1);
    // The forced run neither took nor released the owner's lease.
    assert_eq!(row_snapshot(&pool, "nightly_export").await, before);
    assert_eq!(lease_rows(&pool).await, 1);
}

// ---------------------------------------------------------------------------
// Lock manager
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_expired_lease_is_taken_over(pool: PgPool) {
    seed_expired(&pool, "weekly_digest", "proc-dead").await;

    let locks = LockManager::new(store(&pool), "proc-3");
    let outcome = locks.acquire("weekly_digest", LEASE).await.unwrap();
    assert_matches!(
        outcome,
        AcquireOutcome::Acquired { ref lease, ref previous_holder }
            if lease.holder == "proc-3" && previous_holder.as_deref() == Some("proc-dead")
    );

    let row = JobLeaseRepo::find_by_job(&pool, "weekly_digest")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.holder, "proc-3");
    assert!(row.expires_at > Utc::now());

    assert_eq!(
        locks.release("weekly_digest").await.unwrap(),
        ReleaseOutcome::Released
    );
    assert_eq!(lease_rows(&pool).await, 0);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_concurrent_acquires_have_one_winner(pool: PgPool) {
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let locks = LockManager::new(store(&pool), format!("proc-{i}"));
            tokio::spawn(async move { locks.acquire("purge_old_records", LEASE).await })
        })
        .collect();

    let mut acquired = 0;
    for handle in handles {
        if let AcquireOutcome::Acquired { .. } = handle.await.unwrap().unwrap() {
            acquired += 1;
        }
    }

    assert_eq!(acquired, 1);
    assert_eq!(lease_rows(&pool).await, 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_concurrent_takeovers_of_expired_lease_have_one_winner(pool: PgPool) {
    for round in 0..40 {
        sqlx::query("DELETE FROM job_leases")
            .execute(&pool)
            .await
            .unwrap();
        seed_expired(&pool, "weekly_digest", "proc-dead").await;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let locks = LockManager::new(store(&pool), format!("proc-{round}-{i}"));
                tokio::spawn(async move { locks.acquire("weekly_digest", LEASE).await })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                AcquireOutcome::Acquired {
                    lease,
                    previous_holder,
                } => {
                    assert_eq!(previous_holder.as_deref(), Some("proc-dead"));
                    winners.push(lease.holder);
                }
                AcquireOutcome::Rejected { .. } => {}
            }
        }

        assert_eq!(winners.len(), 1, "round {round}: winners {winners:?}");
        let row = JobLeaseRepo::find_by_job(&pool, "weekly_digest")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.holder, winners[0], "round {round}");
    }
}
