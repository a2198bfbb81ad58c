//! Typed configuration.
//!
//! Process-level settings come from environment variables and fail fast if a
//! required one is missing. Engine tuning lives in an optional TOML file where
//! every field has a default.

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub settings_path: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub processor_id: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_path: PathBuf::from(required_var("TIERQ_DATABASE")?),
            settings_path: std::env::var("TIERQ_SETTINGS").ok().map(PathBuf::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            processor_id: std::env::var("TIERQ_PROCESSOR_ID").unwrap_or_else(|_| default_processor_id()),
        })
    }

    /// Engine settings from `settings_path`, or the defaults when none is configured.
    pub fn engine_settings(&self) -> Result<EngineSettings> {
        match &self.settings_path {
            Some(path) => EngineSettings::load(path),
            None => Ok(EngineSettings::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn default_processor_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("tierq-{}", std::process::id()))
}

/// Tuning knobs for queue processing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Minimum time between progress writes during a long copy.
    pub progress_update_interval_secs: u64,
    /// How far in the future a deferred migration trigger is scheduled.
    pub reinsert_delay_secs: i64,
    /// Delay applied to the scheduled time of a completed entry.
    pub process_delay_secs: i64,
    /// Delay before a postponed entry is picked up again.
    pub postpone_delay_secs: i64,
    /// How long a failed entry is kept before it can be purged.
    pub failed_expiration_secs: i64,
    /// Failures tolerated before a stale in-progress entry is failed on restart.
    pub max_failure_count: u32,
    /// Attempts made by the deadlock retry wrapper before giving up.
    pub deadlock_max_attempts: u32,
    /// Wait before the first contention retry; later retries wait longer.
    pub deadlock_retry_min_wait_ms: u64,
    /// Upper bound on the wait between contention retries.
    pub deadlock_retry_max_wait_ms: u64,
    /// Wait between attempts to record a failure while the database is unavailable.
    pub failure_retry_wait_ms: u64,
    /// Maximum characters stored in the failure description column.
    pub failure_description_limit: usize,
    /// Number of samples in each statistics averaging window.
    pub statistics_log_every: u32,
    pub poll_interval_ms: u64,
    pub max_concurrent: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            progress_update_interval_secs: 10,
            reinsert_delay_secs: 600,
            process_delay_secs: 10,
            postpone_delay_secs: 60,
            failed_expiration_secs: 86_400,
            max_failure_count: 3,
            deadlock_max_attempts: 5,
            deadlock_retry_min_wait_ms: 1_000,
            deadlock_retry_max_wait_ms: 3_000,
            failure_retry_wait_ms: 2_000,
            failure_description_limit: 512,
            statistics_log_every: 5,
            poll_interval_ms: 5_000,
            max_concurrent: 4,
        }
    }
}

impl EngineSettings {
    /// Load settings from a TOML file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad settings {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn progress_update_interval(&self) -> Duration {
        Duration::from_secs(self.progress_update_interval_secs)
    }

    /// Retry policy for transient storage contention.
    pub fn deadlock_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.deadlock_max_attempts,
            Duration::from_millis(self.deadlock_retry_min_wait_ms),
            Duration::from_millis(self.deadlock_retry_max_wait_ms),
        )
    }

    pub fn failure_retry_wait(&self) -> Duration {
        Duration::from_millis(self.failure_retry_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
