//! Job lease row model.

use clubops_core::leasing::JobLease;
use clubops_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `job_leases` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobLeaseRow {
    pub id: DbId,
    pub job_name: String,
    pub holder: String,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl From<JobLeaseRow> for JobLease {
    fn from(row: JobLeaseRow) -> Self {
        JobLease {
            job_name: row.job_name,
            holder: row.holder,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
        }
    }
}
