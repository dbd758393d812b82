//! `clubops-worker` -- run scheduled club jobs under a database lease.
//!
//! Every replica's scheduler may fire the same job at the same time; the
//! lease in `job_leases` makes sure only one of them runs the body.
//!
//! # Environment variables
//!
//! | Variable                  | Required | Default   | Description                          |
//! |---------------------------|----------|-----------|--------------------------------------|
//! | `DATABASE_URL`            | yes      | --        | PostgreSQL URL holding `job_leases`  |
//! | `DB_MAX_CONNECTIONS`      | no       | `2`       | Pool size                            |
//! | `DB_ACQUIRE_TIMEOUT_SECS` | no       | `10`      | Wait for a pooled connection         |
//! | `LEASE_HOLDER`            | no       | derived   | Holder identity override             |
//! | `LOG_FORMAT`              | no       | `text`    | `text` or `json`                     |
//! | `RUN_MIGRATIONS`          | no       | `false`   | Apply migrations before running      |
//!
//! # Exit status
//!
//! `0` success or skipped, `1` job failed, `2` lease store unavailable,
//! `3` invalid configuration or job definition.

use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use clubops_core::leasing::{JobLease, LeaseStore};
use clubops_worker::cli::{Cli, Commands, LeasesArgs, RunArgs};
use clubops_worker::config::{LogFormat, WorkerConfig};
use clubops_worker::holder::resolve_holder;
use clubops_worker::job::JobOptions;
use clubops_worker::jobs::CommandJob;
use clubops_worker::logger::init_tracing;
use clubops_worker::runner::{
    JobRunner, RunOutcome, EXIT_INVALID, EXIT_OK, EXIT_STORE_UNAVAILABLE,
};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = WorkerConfig::from_env();
    let log_format = config
        .as_ref()
        .map(|c| c.log_format)
        .unwrap_or(LogFormat::Text);
    init_tracing(cli.common.verbosity(), log_format);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_INVALID);
        }
    };

    ExitCode::from(run(cli, config).await)
}

async fn run(cli: Cli, config: WorkerConfig) -> u8 {
    let holder = match resolve_holder(config.lease_holder.as_deref()) {
        Ok(holder) => holder,
        Err(e) => {
            tracing::error!(error = %e, "Invalid lease holder");
            return EXIT_INVALID;
        }
    };

    let pool = match clubops_db::create_pool(
        &config.database_url,
        config.max_connections,
        config.acquire_timeout,
    )
    .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to the lease database");
            return EXIT_STORE_UNAVAILABLE;
        }
    };

    if let Err(e) = clubops_db::health_check(&pool).await {
        tracing::error!(error = %e, "Lease database health check failed");
        return EXIT_STORE_UNAVAILABLE;
    }

    if config.run_migrations {
        if let Err(e) = clubops_db::run_migrations(&pool).await {
            tracing::error!(error = %e, "Failed to run migrations");
            return EXIT_STORE_UNAVAILABLE;
        }
        tracing::info!("Database migrations applied");
    }

    let store: Arc<dyn LeaseStore> = Arc::new(clubops_db::PgLeaseStore::new(pool));
    let options = cli.common.job_options();

    tracing::debug!(holder = %holder, ?options, "Starting clubops-worker");

    match cli.command {
        Commands::Run(args) => run_job(store, holder, args, options).await,
        Commands::Leases(args) => list_leases(store.as_ref(), &args).await,
        Commands::Sweep => sweep(store, holder, options).await,
    }
}

async fn run_job(
    store: Arc<dyn LeaseStore>,
    holder: String,
    args: RunArgs,
    options: JobOptions,
) -> u8 {
    let lease_duration = args.lease_duration();
    let job = match CommandJob::new(args.job_name, lease_duration, args.command) {
        Ok(job) => job.with_pass_dry_run(args.pass_dry_run),
        Err(e) => {
            tracing::error!(error = %e, "Invalid job definition");
            return EXIT_INVALID;
        }
    };

    let runner = JobRunner::new(store, holder);
    match runner.run(&job, options).await {
        Ok(RunOutcome::Success { elapsed, dry_run }) => {
            tracing::debug!(
                elapsed_ms = elapsed.as_millis() as u64,
                dry_run,
                "Run finished"
            );
            EXIT_OK
        }
        Ok(RunOutcome::Skipped { .. }) => EXIT_OK,
        Err(e) => {
            tracing::debug!(error = %e, "Run failed");
            e.exit_code()
        }
    }
}

async fn list_leases(store: &dyn LeaseStore, args: &LeasesArgs) -> u8 {
    let leases = match store.list().await {
        Ok(leases) => leases,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list leases");
            return EXIT_STORE_UNAVAILABLE;
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&leases) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize leases");
                return EXIT_INVALID;
            }
        }
    } else {
        print_lease_table(&leases);
    }
    EXIT_OK
}

fn print_lease_table(leases: &[JobLease]) {
    if leases.is_empty() {
        println!("No leases held.");
        return;
    }
    let now = Utc::now();
    println!(
        "{:<32} {:<40} {:<25} {:<25} STATE",
        "JOB", "HOLDER", "ACQUIRED", "EXPIRES"
    );
    for lease in leases {
        let state = if lease.is_expired_at(now) {
            "expired"
        } else {
            "held"
        };
        println!(
            "{:<32} {:<40} {:<25} {:<25} {state}",
            lease.job_name,
            lease.holder,
            lease.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"),
            lease.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }
}

async fn sweep(store: Arc<dyn LeaseStore>, holder: String, options: JobOptions) -> u8 {
    if options.dry_run {
        // Count without deleting.
        return match store.list().await {
            Ok(leases) => {
                let now = Utc::now();
                let expired = leases.iter().filter(|l| l.is_expired_at(now)).count();
                println!("Would sweep {expired} expired lease(s)");
                EXIT_OK
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to list leases");
                EXIT_STORE_UNAVAILABLE
            }
        };
    }

    match JobRunner::new(store, holder).sweep().await {
        Ok(swept) => {
            println!("Swept {swept} expired lease(s)");
            EXIT_OK
        }
        Err(e) => {
            tracing::error!(error = %e, "Lease sweep failed");
            EXIT_STORE_UNAVAILABLE
        }
    }
}
