//! `clubops-worker` library crate.
//!
//! The execution harness for scheduled jobs: lease acquisition through
//! [`lock_manager::LockManager`], invocation and cleanup through
//! [`runner::JobRunner`], and the [`job::Job`] contract every job body
//! implements. The binary entrypoint lives in `main.rs`.

pub mod cli;
pub mod config;
pub mod holder;
pub mod job;
pub mod jobs;
pub mod lock_manager;
pub mod logger;
pub mod runner;
