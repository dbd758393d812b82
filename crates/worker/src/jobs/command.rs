//! Run an external command as a job body.
//!
//! Lets any existing scheduled script (a management command, a shell
//! script, a binary) run under the lease lock without being rewritten:
//! the harness acquires the lease, spawns the command with inherited
//! stdio, and treats a non-zero exit status as a job failure.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clubops_core::error::CoreError;
use tokio::process::Command;

use crate::job::{Job, JobContext};

/// Env var carrying the job name into the child process.
pub const JOB_NAME_ENV: &str = "CLUBOPS_JOB_NAME";
/// Env var set to `1` when the child runs in dry-run mode.
pub const DRY_RUN_ENV: &str = "CLUBOPS_DRY_RUN";
/// Env var set to `1` when the invocation bypassed the lease.
pub const FORCE_ENV: &str = "CLUBOPS_FORCE";

/// A job whose body is an external command.
#[derive(Debug, Clone)]
pub struct CommandJob {
    job_name: String,
    lease_duration: Duration,
    program: String,
    args: Vec<String>,
    /// Spawn the command in dry-run mode (with `CLUBOPS_DRY_RUN=1`) so it
    /// can print its own preview, instead of only logging the command line.
    pass_dry_run: bool,
}

impl CommandJob {
    /// Build a command job from an argv vector (`argv[0]` is the program).
    pub fn new(
        job_name: impl Into<String>,
        lease_duration: Duration,
        argv: Vec<String>,
    ) -> Result<Self, CoreError> {
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| CoreError::Validation("A command to run is required".into()))?;
        Ok(Self {
            job_name: job_name.into(),
            lease_duration,
            program,
            args: argv.collect(),
            pass_dry_run: false,
        })
    }

    pub fn with_pass_dry_run(mut self, pass_dry_run: bool) -> Self {
        self.pass_dry_run = pass_dry_run;
        self
    }

    /// The command line, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

#[async_trait]
impl Job for CommandJob {
    fn name(&self) -> &str {
        &self.job_name
    }

    fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    async fn execute(&self, ctx: &JobContext) -> anyhow::Result<()> {
        let command_line = self.command_line();
        if ctx.dry_run() && !self.pass_dry_run {
            ctx.logger.info(format!("Would run: {command_line}"));
            return Ok(());
        }

        ctx.logger.verbose(format!("Running: {command_line}"));
        let status = Command::new(&self.program)
            .args(&self.args)
            .env(JOB_NAME_ENV, &self.job_name)
            .env(DRY_RUN_ENV, flag(ctx.dry_run()))
            .env(FORCE_ENV, flag(ctx.options.force))
            .stdin(Stdio::null())
            .status()
            .await
            .with_context(|| format!("failed to start `{}`", self.program))?;

        if !status.success() {
            match status.code() {
                Some(code) => bail!("`{command_line}` exited with status {code}"),
                None => bail!("`{command_line}` was terminated by a signal"),
            }
        }
        Ok(())
    }
}
