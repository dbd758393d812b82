//! Shared types, errors, and the lease-store port for the clubops
//! scheduled-job coordination layer.
//!
//! This crate has no internal dependencies so that the database adapter,
//! the worker harness, and tests can all agree on the same lease model.

pub mod error;
pub mod leasing;
pub mod types;
