//! Execution harness for one invocation of a scheduled job.
//!
//! Sequence: sweep expired leases (all jobs), then either run the body in
//! dry-run mode without touching the lock, run it under `--force` without
//! acquiring, or acquire the lease, run the body, and release. A failing
//! body still releases its lease before the failure is returned. Problems
//! during release are logged as warnings and never change the outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use clubops_core::error::CoreError;
use clubops_core::leasing::{
    validate_job_name, validate_lease_duration, LeaseStore, LeaseStoreError,
};
use futures::FutureExt;

use crate::job::{Job, JobContext, JobOptions};
use crate::lock_manager::{AcquireOutcome, LockError, LockManager, ReleaseOutcome};
use crate::logger::JobLogger;

/// Process exit status for a successful or skipped run.
pub const EXIT_OK: u8 = 0;
/// Process exit status when the job body failed.
pub const EXIT_JOB_FAILED: u8 = 1;
/// Process exit status when the lease store could not be used.
pub const EXIT_STORE_UNAVAILABLE: u8 = 2;
/// Process exit status for invalid configuration or job definitions.
pub const EXIT_INVALID: u8 = 3;

/// How an invocation ended, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The body ran to completion.
    Success { elapsed: Duration, dry_run: bool },
    /// Another process holds the lease; the body was not run.
    Skipped { holder: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The job name or lease duration was rejected before any store call.
    #[error(transparent)]
    Validation(#[from] CoreError),

    /// The sweep or the acquire failed against the store, either because it
    /// was unreachable or because a statement failed. The body was not run.
    #[error(transparent)]
    StoreUnavailable(#[from] LeaseStoreError),

    /// The job body returned an error or panicked.
    #[error("Job '{job_name}' failed: {error:#}")]
    Job {
        job_name: String,
        elapsed: Duration,
        error: anyhow::Error,
    },
}

impl RunError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => EXIT_INVALID,
            Self::StoreUnavailable(_) => EXIT_STORE_UNAVAILABLE,
            Self::Job { .. } => EXIT_JOB_FAILED,
        }
    }
}

impl From<LockError> for RunError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Invalid(e) => Self::Validation(e),
            LockError::Store(e) => Self::StoreUnavailable(e),
        }
    }
}

/// Runs jobs against a lease store on behalf of one holder identity.
pub struct JobRunner {
    store: Arc<dyn LeaseStore>,
    locks: LockManager,
}

impl JobRunner {
    pub fn new(store: Arc<dyn LeaseStore>, holder: impl Into<String>) -> Self {
        let locks = LockManager::new(store.clone(), holder);
        Self { store, locks }
    }

    pub fn holder(&self) -> &str {
        self.locks.holder()
    }

    /// Delete expired leases for every job. Returns the number removed.
    pub async fn sweep(&self) -> Result<u64, LeaseStoreError> {
        let swept = self.store.sweep_expired(Utc::now()).await?;
        if swept > 0 {
            tracing::info!(swept, "Swept expired job leases");
        }
        Ok(swept)
    }

    /// Run one invocation of `job`.
    pub async fn run(&self, job: &dyn Job, options: JobOptions) -> Result<RunOutcome, RunError> {
        let job_name = job.name();
        validate_job_name(job_name)?;
        validate_lease_duration(job.lease_duration())?;

        let ctx = JobContext::new(job_name, options);
        let logger = &ctx.logger;

        if let Err(e) = self.sweep().await {
            logger.error(format!("Lease sweep failed, not running: {e}"));
            return Err(e.into());
        }

        if options.dry_run {
            logger.info("Dry run: skipping lease checks; no changes will be made");
            let elapsed = self.invoke(job, &ctx).await?;
            return Ok(RunOutcome::Success {
                elapsed,
                dry_run: true,
            });
        }

        let mut held = false;
        if options.force {
            logger.warning(format!(
                "--force: running without the lease check (holder {})",
                self.holder()
            ));
        } else {
            match self.locks.acquire(job_name, job.lease_duration()).await {
                Ok(AcquireOutcome::Acquired {
                    lease,
                    previous_holder,
                }) => {
                    if let Some(previous) = previous_holder {
                        logger.warning(format!("Took over expired lease from {previous}"));
                    }
                    logger.verbose(format!(
                        "Lease held by {} until {}",
                        lease.holder, lease.expires_at
                    ));
                    held = true;
                }
                Ok(AcquireOutcome::Rejected { holder, .. }) => {
                    logger.info(format!("Already running on {holder}; skipping"));
                    return Ok(RunOutcome::Skipped { holder });
                }
                Err(e) => {
                    logger.error(format!("Could not acquire lease, not running: {e}"));
                    return Err(e.into());
                }
            }
        }

        let result = self.invoke(job, &ctx).await;

        if held {
            self.release(job_name, logger).await;
        }

        result.map(|elapsed| RunOutcome::Success {
            elapsed,
            dry_run: false,
        })
    }

    /// Call the job body, timing it and converting panics into failures.
    async fn invoke(&self, job: &dyn Job, ctx: &JobContext) -> Result<Duration, RunError> {
        let start = Instant::now();
        let result = AssertUnwindSafe(job.execute(ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!(
                    "job panicked: {}",
                    panic_message(panic.as_ref())
                ))
            });
        let elapsed = start.elapsed();

        match result {
            Ok(()) => {
                ctx.logger
                    .success(format!("Completed in {:.2}s", elapsed.as_secs_f64()));
                Ok(elapsed)
            }
            Err(error) => {
                ctx.logger.error(format!(
                    "Failed after {:.2}s: {error:#}",
                    elapsed.as_secs_f64()
                ));
                Err(RunError::Job {
                    job_name: job.name().to_string(),
                    elapsed,
                    error,
                })
            }
        }
    }

    /// Release the lease. Never fails the run.
    async fn release(&self, job_name: &str, logger: &JobLogger) {
        match self.locks.release(job_name).await {
            Ok(ReleaseOutcome::Released) => logger.verbose("Lease released"),
            Ok(ReleaseOutcome::NotHeld) => logger.warning(
                "Lease was no longer held at release; it expired and was swept or taken over",
            ),
            Err(e) => logger.warning(format!("Failed to release lease: {e}")),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
