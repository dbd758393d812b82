//! Lease holder identity for this process.
//!
//! The identity is opaque to the lock protocol (compared for equality and
//! logged), but is built to be useful in diagnostics:
//! `<hostname>:<pid>:<nonce>`. The nonce keeps identities distinct when a
//! container restarts with the same hostname and pid.

use clubops_core::error::CoreError;
use clubops_core::leasing::validate_holder;

/// Hostname used when neither `HOSTNAME` nor `/etc/hostname` is available.
const FALLBACK_HOSTNAME: &str = "localhost";

/// Resolve the holder identity: an explicit override (from `LEASE_HOLDER`)
/// or one derived from the host and process.
pub fn resolve_holder(explicit: Option<&str>) -> Result<String, CoreError> {
    let holder = match explicit {
        Some(value) => value.trim().to_string(),
        None => local_holder_id(),
    };
    validate_holder(&holder)?;
    Ok(holder)
}

/// Build `<hostname>:<pid>:<nonce>` for the current process.
pub fn local_holder_id() -> String {
    format!("{}:{}:{}", hostname(), std::process::id(), nonce())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| FALLBACK_HOSTNAME.to_string())
}

fn nonce() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
