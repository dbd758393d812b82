//! Verbosity-gated logging for the harness and job bodies.
//!
//! Job bodies log through [`JobLogger`] instead of writing to the console
//! so that every line carries the job name and honours `--verbosity`.

use std::fmt::Display;

use clubops_core::error::CoreError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

/// Output detail requested on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Warnings and errors only.
    Quiet = 0,
    #[default]
    Normal = 1,
    /// Adds per-step detail.
    Verbose = 2,
}

impl Verbosity {
    pub fn level(self) -> u8 {
        self as u8
    }

    /// `EnvFilter` directives used when `RUST_LOG` is not set.
    pub fn default_filter(self) -> &'static str {
        match self {
            Self::Quiet => "warn",
            Self::Normal => "warn,clubops_worker=info,clubops_db=info",
            Self::Verbose => "warn,clubops_worker=debug,clubops_db=debug,clubops_core=debug",
        }
    }
}

impl TryFrom<u8> for Verbosity {
    type Error = CoreError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::Quiet),
            1 => Ok(Self::Normal),
            2 => Ok(Self::Verbose),
            other => Err(CoreError::Validation(format!(
                "Verbosity must be 0, 1 or 2, got {other}"
            ))),
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise the filter follows `verbosity`.
pub fn init_tracing(verbosity: Verbosity, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| verbosity.default_filter().into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Leveled logger handed to job bodies.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_name: String,
    verbosity: Verbosity,
}

impl JobLogger {
    pub fn new(job_name: impl Into<String>, verbosity: Verbosity) -> Self {
        Self {
            job_name: job_name.into(),
            verbosity,
        }
    }

    /// Returns `true` if messages requiring `required` are emitted.
    pub fn enabled(&self, required: Verbosity) -> bool {
        self.verbosity >= required
    }

    pub fn info(&self, message: impl Display) {
        if self.enabled(Verbosity::Normal) {
            tracing::info!(job = %self.job_name, "{message}");
        }
    }

    pub fn success(&self, message: impl Display) {
        if self.enabled(Verbosity::Normal) {
            tracing::info!(job = %self.job_name, outcome = "success", "{message}");
        }
    }

    /// Detail shown only at `--verbosity 2`.
    pub fn verbose(&self, message: impl Display) {
        if self.enabled(Verbosity::Verbose) {
            tracing::debug!(job = %self.job_name, "{message}");
        }
    }

    pub fn warning(&self, message: impl Display) {
        tracing::warn!(job = %self.job_name, "{message}");
    }

    pub fn error(&self, message: impl Display) {
        tracing::error!(job = %self.job_name, "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_from_level() {
        assert_eq!(Verbosity::try_from(0).unwrap(), Verbosity::Quiet);
        assert_eq!(Verbosity::try_from(1).unwrap(), Verbosity::Normal);
        assert_eq!(Verbosity::try_from(2).unwrap(), Verbosity::Verbose);
        assert!(Verbosity::try_from(3).is_err());
    }

    #[test]
    fn test_level_round_trips() {
        for level in 0..=2u8 {
            assert_eq!(Verbosity::try_from(level).unwrap().level(), level);
        }
    }

    #[test]
    fn test_gating_by_verbosity() {
        let quiet = JobLogger::new("purge_old_records", Verbosity::Quiet);
        assert!(!quiet.enabled(Verbosity::Normal));
        assert!(quiet.enabled(Verbosity::Quiet));

        let normal = JobLogger::new("purge_old_records", Verbosity::Normal);
        assert!(normal.enabled(Verbosity::Normal));
        assert!(!normal.enabled(Verbosity::Verbose));

        let verbose = JobLogger::new("purge_old_records", Verbosity::Verbose);
        assert!(verbose.enabled(Verbosity::Verbose));
    }

    #[test]
    fn test_default_filters_widen_with_verbosity() {
        assert_eq!(Verbosity::Quiet.default_filter(), "warn");
        let normal = Verbosity::Normal.default_filter();
        assert!(normal.contains("clubops_worker=info"));
        let verbose = Verbosity::Verbose.default_filter();
        assert!(verbose.contains("clubops_worker=debug"));
    }
}
