//! Item processors and the finalization they share.
//!
//! [`process_entry`] is the common path for every claimed entry: load the
//! study's storage location, postpone if the study is not ready, run the
//! type-specific processor, and persist the [`Outcome`] onto the entry.

use chrono::{Duration, Utc};

use crate::alert::{Alert, AlertLevel, codes};
use crate::config::EngineSettings;
use crate::error::Result;
use crate::model::{QueueEntry, QueueStatus, QueueStudyState, QueueType, StorageLocation};
use crate::retry::retry_on_deadlock;
use crate::stats::SharedStatistics;
use crate::storage::{Broker, QueueUpdate, Storage, StorageLocationUpdate};

/// Result of one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The work is done.
    Completed,
    /// Preconditions not met. The real work was rescheduled elsewhere and this
    /// attempt finishes as a no-op.
    Deferred { reason: String },
    /// The study is not ready. The entry itself goes back to Pending.
    Postponed { reason: String },
    Failed { reason: String },
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Deferred { .. } => "deferred",
            Outcome::Postponed { .. } => "postponed",
            Outcome::Failed { .. } => "failed",
        }
    }

    /// Status the entry ends up in.
    pub fn status(&self) -> QueueStatus {
        match self {
            Outcome::Completed | Outcome::Deferred { .. } => QueueStatus::Completed,
            Outcome::Postponed { .. } => QueueStatus::Pending,
            Outcome::Failed { .. } => QueueStatus::Failed,
        }
    }
}

/// Everything one processing attempt may touch.
pub struct ProcessContext<'a> {
    pub storage: &'a Storage,
    /// Separate connection for writes that must commit while `storage` has a
    /// transaction open (progress lines).
    pub progress: &'a Storage,
    pub settings: &'a EngineSettings,
    pub statistics: &'a SharedStatistics,
}

/// Type-specific work for one queue type.
pub trait ItemProcessor: Send + Sync {
    fn queue_type(&self) -> QueueType;

    /// Run the work for `entry` against the study at `location`.
    ///
    /// `Err` is reserved for unexpected faults; the processor loop turns it
    /// into a failed entry.
    fn process(
        &self,
        ctx: &ProcessContext<'_>,
        entry: &QueueEntry,
        location: &StorageLocation,
    ) -> Result<Outcome>;
}

/// Shared preamble, dispatch and finalization for one claimed entry.
pub fn process_entry(
    processor: &dyn ItemProcessor,
    ctx: &ProcessContext<'_>,
    entry: &QueueEntry,
) -> Result<Outcome> {
    let location = ctx
        .storage
        .broker()
        .get_storage_location(entry.study_storage_key)?;

    let outcome = match location {
        None => Outcome::Postponed {
            reason: format!("storage location {} not found", entry.study_storage_key),
        },
        Some(location)
            if location.queue_study_state == QueueStudyState::ReprocessScheduled
                && entry.queue_type != QueueType::ReprocessStudy =>
        {
            Outcome::Postponed {
                reason: format!(
                    "study {} is scheduled for reprocess",
                    location.study_instance_uid
                ),
            }
        }
        Some(location) => processor.process(ctx, entry, &location)?,
    };

    match &outcome {
        Outcome::Completed => complete_entry(ctx.storage, entry, ctx.settings)?,
        Outcome::Deferred { reason } => {
            tracing::info!(entry = %entry.id, %reason, "deferred");
            complete_entry(ctx.storage, entry, ctx.settings)?
        }
        Outcome::Postponed { reason } => {
            tracing::info!(entry = %entry.id, %reason, "postponed");
            postpone_entry(ctx.storage, entry, reason, ctx.settings)?
        }
        Outcome::Failed { reason } => fail_entry(ctx.storage, entry, reason, ctx.settings)?,
    }
    Ok(outcome)
}

/// Mark the entry Completed and reset the study's queue state.
///
/// The scheduled time moves `process_delay` ahead, capped at the expiration.
/// The failure count is preserved.
pub fn complete_entry(storage: &Storage, entry: &QueueEntry, settings: &EngineSettings) -> Result<()> {
    let mut scheduled = Utc::now() + Duration::seconds(settings.process_delay_secs);
    if let Some(expiration) = entry.expiration_time {
        scheduled = scheduled.min(expiration);
    }

    retry_on_deadlock(&settings.deadlock_retry(), || {
        storage.with_transaction(|broker| {
            broker.update_queue_entry(
                entry.id,
                &QueueUpdate {
                    status: Some(QueueStatus::Completed),
                    processor_id: Some(None),
                    scheduled_time: Some(scheduled),
                    ..QueueUpdate::default()
                },
            )?;
            reset_queue_state(broker, entry)
        })
    })
}

/// Put the entry back to Pending for a later attempt.
pub fn postpone_entry(
    storage: &Storage,
    entry: &QueueEntry,
    reason: &str,
    settings: &EngineSettings,
) -> Result<()> {
    let scheduled = Utc::now() + Duration::seconds(settings.postpone_delay_secs);
    let expiration = scheduled + Duration::minutes(2);

    retry_on_deadlock(&settings.deadlock_retry(), || {
        storage.with_transaction(|broker| {
            broker.update_queue_entry(
                entry.id,
                &QueueUpdate {
                    status: Some(QueueStatus::Pending),
                    processor_id: Some(None),
                    scheduled_time: Some(scheduled),
                    expiration_time: Some(Some(expiration)),
                    failure_description: Some(Some(truncate(reason, settings.failure_description_limit))),
                    ..QueueUpdate::default()
                },
            )?;
            Ok(())
        })
    })
}

/// Mark the entry Failed and raise an operator alert.
///
/// Failed entries are not retried automatically; they stay for inspection
/// until `failed_expiration` passes and the purge removes them.
pub fn fail_entry(
    storage: &Storage,
    entry: &QueueEntry,
    reason: &str,
    settings: &EngineSettings,
) -> Result<()> {
    let now = Utc::now();
    let description = truncate(reason, settings.failure_description_limit);
    let alert = Alert::new(
        AlertLevel::Error,
        entry.queue_type.as_str(),
        codes::ENTRY_FAILED,
        format!("{} entry failed: {description}", entry.queue_type),
    )
    .for_entry(entry);

    retry_on_deadlock(&settings.deadlock_retry(), || {
        storage.with_transaction(|broker| {
            broker.update_queue_entry(
                entry.id,
                &QueueUpdate {
                    status: Some(QueueStatus::Failed),
                    processor_id: Some(None),
                    scheduled_time: Some(now),
                    expiration_time: Some(Some(now + Duration::seconds(settings.failed_expiration_secs))),
                    failure_count: Some(entry.failure_count + 1),
                    failure_description: Some(Some(description.clone())),
                    ..QueueUpdate::default()
                },
            )?;
            reset_queue_state(broker, entry)?;
            broker.insert_alert(&alert)?;
            Ok(())
        })
    })?;

    alert.log();
    Ok(())
}

fn reset_queue_state(broker: &Broker<'_>, entry: &QueueEntry) -> Result<()> {
    broker.update_storage_location(
        entry.study_storage_key,
        &StorageLocationUpdate {
            queue_study_state: Some(QueueStudyState::Idle),
            ..StorageLocationUpdate::default()
        },
    )?;
    Ok(())
}

/// First `limit` characters of `s`.
pub(crate) fn truncate(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}
