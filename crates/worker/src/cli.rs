use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::job::JobOptions;
use crate::logger::Verbosity;

/// Default `run --lease-secs`: ten minutes.
pub const DEFAULT_LEASE_SECS: u64 = 600;

/// Run scheduled club maintenance jobs so that only one replica executes
/// each job at a time.
#[derive(Parser, Debug)]
#[command(name = "clubops-worker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options every job invocation accepts.
#[derive(Args, Debug, Clone, Copy)]
pub struct CommonArgs {
    /// Run even if another process holds the lease. Does not keep other
    /// replicas out.
    #[arg(long, global = true)]
    pub force: bool,

    /// Preview: no lease operations; the job must not make changes.
    #[arg(long = "dry-run", global = true)]
    pub dry_run: bool,

    /// Output detail: 0 = warnings only, 1 = normal, 2 = verbose.
    #[arg(
        long,
        global = true,
        default_value_t = 1,
        value_parser = clap::value_parser!(u8).range(0..=2)
    )]
    pub verbosity: u8,
}

impl CommonArgs {
    pub fn verbosity(&self) -> Verbosity {
        // The value parser bounds the range, so this fallback is unreachable.
        Verbosity::try_from(self.verbosity).unwrap_or_default()
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            force: self.force,
            dry_run: self.dry_run,
            verbosity: self.verbosity(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command as a job under the lease lock.
    Run(RunArgs),
    /// List current leases.
    Leases(LeasesArgs),
    /// Delete expired leases for every job.
    Sweep,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Unique job name, used as the lease key.
    #[arg(long = "job-name", value_name = "NAME")]
    pub job_name: String,

    /// Maximum expected run time; the lease expires after it.
    #[arg(long = "lease-secs", value_name = "SECONDS", default_value_t = DEFAULT_LEASE_SECS)]
    pub lease_secs: u64,

    /// In dry-run mode, still start the command (with CLUBOPS_DRY_RUN=1)
    /// so it can print its own preview.
    #[arg(long = "pass-dry-run")]
    pub pass_dry_run: bool,

    /// Program and arguments, after `--`.
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl RunArgs {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[derive(Args, Debug)]
pub struct LeasesArgs {
    /// Print leases as JSON.
    #[arg(long)]
    pub json: bool,
}
