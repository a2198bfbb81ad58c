//! Operator alerts.
//!
//! Alerts are the channel for conditions a human has to act on: failed
//! entries, orphaned study folders left behind after a tier move. Every alert
//! is persisted and echoed to the log at a matching level.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::Error;
use crate::model::{QueueEntry, QueueEntryId, QueueType, StudyStorageKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Informational,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Informational => "informational",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl FromStr for AlertLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "informational" => Ok(AlertLevel::Informational),
            "warning" => Ok(AlertLevel::Warning),
            "error" => Ok(AlertLevel::Error),
            "critical" => Ok(AlertLevel::Critical),
            _ => Err(Error::Other(format!("unknown alert level: {s}"))),
        }
    }
}

/// The queue entry an alert was raised for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertContext {
    pub entry_id: QueueEntryId,
    pub queue_type: QueueType,
    pub study_storage_key: StudyStorageKey,
}

impl From<&QueueEntry> for AlertContext {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            entry_id: entry.id,
            queue_type: entry.queue_type,
            study_storage_key: entry.study_storage_key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    /// Component that raised it, e.g. the queue type.
    pub source: String,
    /// Stable numeric code so dashboards can group repeats.
    pub code: u32,
    pub message: String,
    pub context: Option<AlertContext>,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, source: impl Into<String>, code: u32, message: impl Into<String>) -> Self {
        Self {
            level,
            source: source.into(),
            code,
            message: message.into(),
            context: None,
            raised_at: Utc::now(),
        }
    }

    pub fn for_entry(mut self, entry: &QueueEntry) -> Self {
        self.context = Some(AlertContext::from(entry));
        self
    }

    /// Echo the alert to the log.
    pub fn log(&self) {
        let entry = self.context.as_ref().map(|c| c.entry_id.to_string());
        match self.level {
            AlertLevel::Informational => {
                tracing::info!(source = %self.source, code = self.code, entry = entry.as_deref(), "alert: {}", self.message)
            }
            AlertLevel::Warning => {
                tracing::warn!(source = %self.source, code = self.code, entry = entry.as_deref(), "alert: {}", self.message)
            }
            AlertLevel::Error | AlertLevel::Critical => {
                tracing::error!(source = %self.source, code = self.code, entry = entry.as_deref(), "alert: {}", self.message)
            }
        }
    }
}

/// Alert codes raised by this crate.
pub mod codes {
    pub const ENTRY_FAILED: u32 = 1;
    pub const ORPHANED_STUDY_FOLDER: u32 = 1000;
}
