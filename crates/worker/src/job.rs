//! The contract between the harness and a job body.

use std::time::Duration;

use async_trait::async_trait;

use crate::logger::{JobLogger, Verbosity};

/// Standard options every job invocation accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Run without checking the lease. Operator override only; it does not
    /// keep other replicas out.
    pub force: bool,
    /// Preview mode: no locking, and the body must not make changes.
    pub dry_run: bool,
    pub verbosity: Verbosity,
}

/// What a job body receives when invoked.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub options: JobOptions,
    pub logger: JobLogger,
}

impl JobContext {
    pub fn new(job_name: &str, options: JobOptions) -> Self {
        Self {
            options,
            logger: JobLogger::new(job_name, options.verbosity),
        }
    }

    pub fn dry_run(&self) -> bool {
        self.options.dry_run
    }
}

/// A scheduled task run under the lease lock.
///
/// `name` must be unique across all jobs sharing a lease table.
/// `lease_duration` is the job's declared maximum run time; other
/// replicas treat the lease as abandoned once it has passed.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    fn lease_duration(&self) -> Duration;

    /// Perform the work. Must honour `ctx.dry_run()` for its own side
    /// effects. An error marks the run as failed.
    async fn execute(&self, ctx: &JobContext) -> anyhow::Result<()>;
}
