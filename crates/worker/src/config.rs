//! Worker configuration, read from environment variables.
//!
//! `main` loads `.env` through dotenvy first, so values there are visible
//! to [`WorkerConfig::from_env`].

use std::time::Duration;

use clubops_core::error::CoreError;

/// Default pool size. A scheduled-job process issues a handful of
/// sequential statements, plus one transaction during takeover.
const DEFAULT_MAX_CONNECTIONS: u32 = 2;

/// Default wait for a pooled connection before reporting the store as
/// unavailable.
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(invalid("LOG_FORMAT", value, "'text' or 'json'")),
        }
    }
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL connection URL holding the `job_leases` table.
    pub database_url: String,
    /// Pool size (default: `2`).
    pub max_connections: u32,
    /// Pool acquire timeout (default: 10 seconds).
    pub acquire_timeout: Duration,
    /// Explicit holder identity; derived from host and pid when `None`.
    pub lease_holder: Option<String>,
    pub log_format: LogFormat,
    /// Apply embedded migrations before running (default: `false`).
    pub run_migrations: bool,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                  | Default   |
    /// |--------------------------|-----------|
    /// | `DATABASE_URL`           | required  |
    /// | `DB_MAX_CONNECTIONS`     | `2`       |
    /// | `DB_ACQUIRE_TIMEOUT_SECS`| `10`      |
    /// | `LEASE_HOLDER`           | derived   |
    /// | `LOG_FORMAT`             | `text`    |
    /// | `RUN_MIGRATIONS`         | `false`   |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| CoreError::Config("DATABASE_URL must be set".into()))?;

        let max_connections = parse_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        if max_connections == 0 {
            return Err(invalid("DB_MAX_CONNECTIONS", "0", "at least 1"));
        }

        let acquire_timeout_secs = parse_or(
            &lookup,
            "DB_ACQUIRE_TIMEOUT_SECS",
            DEFAULT_ACQUIRE_TIMEOUT_SECS,
        )?;

        let lease_holder = lookup("LEASE_HOLDER")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let log_format = match lookup("LOG_FORMAT") {
            Some(v) => LogFormat::parse(&v)?,
            None => LogFormat::default(),
        };

        let run_migrations = match lookup("RUN_MIGRATIONS") {
            Some(v) => parse_bool("RUN_MIGRATIONS", &v)?,
            None => false,
        };

        Ok(Self {
            database_url,
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
            lease_holder,
            log_format,
            run_migrations,
        })
    }
}

fn invalid(key: &str, raw: &str, expected: &str) -> CoreError {
    CoreError::Config(format!("{key} must be {expected}, got '{raw}'"))
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, CoreError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| invalid(key, &raw, "a non-negative integer")),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, CoreError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(invalid(key, raw, "a boolean")),
    }
}
