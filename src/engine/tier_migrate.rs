//! Tier migration: move a study to a lower storage tier.
//!
//! State machine, persisted in the entry's data blob:
//!
//! ```text
//! NotStarted --conflict / no destination--> deferred (trigger reinserted)
//! NotStarted --commands ok--> Migrated --> Completed
//! NotStarted --command failed--> Failed
//! Migrated (resumed) --> Completed
//! ```
//!
//! The command sequence is: create `<dest>/<partition>`, create
//! `<dest>/<partition>/<study-folder>`, copy the study directory, update the
//! database, then delete the original directory. The delete is past the point
//! of no return: the database commit lands first.

use std::cell::{Cell, RefCell};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use opentelemetry::KeyValue;
use walkdir::WalkDir;

use super::conflict::{self, TIER_MIGRATE_CONFLICTS};
use super::processor::{ItemProcessor, Outcome, ProcessContext};
use super::state::{self, JobState};
use crate::alert::{Alert, AlertLevel, codes};
use crate::command::{
    Command, CommandProcessor, CopiedFile, CopyDirectory, CreateDirectory, DeleteDirectory,
};
use crate::error::{Error, Result};
use crate::filesystem;
use crate::model::{Filesystem, FilesystemQueueType, QueueEntry, QueueType, StorageLocation};
use crate::retry::{RetryPolicy, retry_on_deadlock};
use crate::stats::MigrationStatistics;
use crate::storage::{Broker, QueueUpdate, StorageLocationUpdate};
use crate::telemetry::metrics;

const MB: f64 = 1024.0 * 1024.0;

pub struct TierMigrateProcessor;

impl ItemProcessor for TierMigrateProcessor {
    fn queue_type(&self) -> QueueType {
        QueueType::TierMigrate
    }

    fn process(
        &self,
        ctx: &ProcessContext<'_>,
        entry: &QueueEntry,
        location: &StorageLocation,
    ) -> Result<Outcome> {
        if state::read_state(entry)? == JobState::Migrated {
            tracing::info!(
                entry = %entry.id,
                study = %location.study_instance_uid,
                "study already migrated, finalizing"
            );
            return Ok(Outcome::Completed);
        }

        let broker = ctx.storage.broker();

        let conflicts = conflict::find_conflicts(&broker, entry, TIER_MIGRATE_CONFLICTS)?;
        if !conflicts.is_empty() {
            let reason = format!("conflicting work on study: {}", conflicts.describe());
            tracing::info!(
                study = %location.study_instance_uid,
                %reason,
                "tier migration has conflicting work, reinserting trigger"
            );
            reinsert_trigger(ctx, location)?;
            return Ok(Outcome::Deferred { reason });
        }

        let Some(destination) = filesystem::select_lower_tier(&broker, location)? else {
            let reason = format!(
                "no writable filesystem below tier {} for study {}",
                location.filesystem_tier, location.study_instance_uid
            );
            tracing::warn!(%reason, "tier migration deferred");
            reinsert_trigger(ctx, location)?;
            return Ok(Outcome::Deferred { reason });
        };

        let statistics = match migrate_study(ctx, entry, location, &destination) {
            Ok(statistics) => statistics,
            Err(e) => {
                tracing::error!(
                    entry = %entry.id,
                    study = %location.study_instance_uid,
                    error = %e,
                    "tier migration failed"
                );
                return Ok(Outcome::Failed {
                    reason: e.to_string(),
                });
            }
        };

        // Separate transaction, so a failed completion write resumes as Migrated.
        retry_on_deadlock(&ctx.settings.deadlock_retry(), || {
            ctx.storage
                .with_transaction(|b| state::write_state(b, entry.id, JobState::Migrated))
        })?;

        record_statistics(ctx, statistics);
        check_original_removed(ctx, entry, location, &destination);

        Ok(Outcome::Completed)
    }
}

/// Replace the study's pending TierMigrate trigger with one further out.
fn reinsert_trigger(ctx: &ProcessContext<'_>, location: &StorageLocation) -> Result<()> {
    let delay = ctx.settings.reinsert_delay_secs.max(1);
    let scheduled = Utc::now() + Duration::seconds(delay);

    retry_on_deadlock(&ctx.settings.deadlock_retry(), || {
        ctx.storage.with_transaction(|broker| {
            broker.delete_filesystem_queue(location.key, FilesystemQueueType::TierMigrate)?;
            broker.insert_filesystem_queue(
                FilesystemQueueType::TierMigrate,
                location.key,
                location.filesystem_key,
                scheduled,
            )?;
            Ok(())
        })
    })
}

fn migrate_study(
    ctx: &ProcessContext<'_>,
    entry: &QueueEntry,
    location: &StorageLocation,
    destination: &Filesystem,
) -> Result<MigrationStatistics> {
    let source_dir = location.study_path();
    let partition_dir = destination.root.join(&location.partition_folder);
    let study_folder_dir = partition_dir.join(&location.study_folder);
    let destination_dir = destination.root.join(location.relative_path());

    tracing::info!(
        study = %location.study_instance_uid,
        from_tier = location.filesystem_tier,
        to = %destination.description,
        to_tier = destination.tier,
        "migrating study"
    );

    let started = Utc::now();
    let timer = Instant::now();
    let clock = PhaseClock::default();
    let tracker = RefCell::new(ProgressTracker::new(
        count_files(&source_dir),
        started,
        ctx.settings.progress_update_interval(),
    ));
    let progress = ctx.progress.broker();

    let on_copied = |file: &CopiedFile| {
        let line = tracker
            .borrow_mut()
            .record(file.bytes, file.is_dicom(), Utc::now());
        if let Some(line) = line {
            tracing::info!(entry = %entry.id, "{line}");
            let update = QueueUpdate {
                failure_description: Some(Some(line)),
                ..QueueUpdate::default()
            };
            if let Err(e) = progress.update_queue_entry(entry.id, &update) {
                tracing::warn!(entry = %entry.id, error = %e, "failed to record progress");
            }
        }
    };

    let mut processor = CommandProcessor::new(format!(
        "migrate study {}",
        location.study_instance_uid
    ));
    processor.add_command(CreateDirectory::new(&partition_dir));
    processor.add_command(CreateDirectory::new(&study_folder_dir));
    processor.add_command(CopyDirectory::new(&source_dir, &destination_dir).on_progress(on_copied));
    processor.add_command(TierMigrateDatabaseUpdateCommand::new(
        location,
        destination,
        &clock,
        ctx.settings.deadlock_retry(),
    ));
    processor.add_command(DeleteDirectory::new(&source_dir).ignore_errors());

    if let Err(e) = processor.execute(ctx.storage) {
        let reason = processor
            .failure_reason()
            .map_or_else(|| e.to_string(), str::to_string);
        return Err(Error::Command {
            command: format!("migrate study {}", location.study_instance_uid),
            reason,
        });
    }
    drop(processor);

    let finished = Instant::now();
    let tracker = tracker.into_inner();
    let copy_done = clock.copy_done.get().unwrap_or(finished);
    let db_done = clock.db_done.get().unwrap_or(finished);

    let statistics = MigrationStatistics {
        study_instance_uid: location.study_instance_uid.clone(),
        bytes: tracker.bytes(),
        files: tracker.files(),
        copy: copy_done.saturating_duration_since(timer),
        db_update: db_done.saturating_duration_since(copy_done),
        delete: finished.saturating_duration_since(db_done),
        total: finished.saturating_duration_since(timer),
    };

    tracing::info!(
        study = %location.study_instance_uid,
        from_tier = location.filesystem_tier,
        to_tier = destination.tier,
        files = statistics.files,
        mb = statistics.bytes as f64 / MB,
        speed_mb_s = statistics.copy_speed_mb_per_sec(),
        db_update_ms = statistics.db_update.as_millis() as u64,
        delete_ms = statistics.delete.as_millis() as u64,
        total_ms = statistics.total.as_millis() as u64,
        "study migrated"
    );
    Ok(statistics)
}

fn record_statistics(ctx: &ProcessContext<'_>, statistics: MigrationStatistics) {
    metrics::bytes_migrated().add(statistics.bytes, &[]);
    metrics::studies_migrated().add(1, &[]);
    metrics::operation_duration_ms().record(
        statistics.total.as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", "tier_migrate")],
    );

    ctx.statistics
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .add(statistics);
}

/// The original directory should be gone; if not, someone has to clean it up.
fn check_original_removed(
    ctx: &ProcessContext<'_>,
    entry: &QueueEntry,
    location: &StorageLocation,
    destination: &Filesystem,
) {
    let original = location.study_path();
    if !original.exists() {
        return;
    }

    let alert = Alert::new(
        AlertLevel::Warning,
        QueueType::TierMigrate.as_str(),
        codes::ORPHANED_STUDY_FOLDER,
        format!(
            "Study {} was migrated to {} but {} could not be removed. Manual cleanup required.",
            location.study_instance_uid,
            destination.description,
            original.display()
        ),
    )
    .for_entry(entry);
    alert.log();
    if let Err(e) = ctx.storage.broker().insert_alert(&alert) {
        tracing::error!(error = %e, "failed to store alert");
    }
}

fn count_files(dir: &std::path::Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count() as u64
}

// ---------------------------------------------------------------------------
// Database update command
// ---------------------------------------------------------------------------

/// Timestamps for splitting a migration's duration into phases.
#[derive(Default)]
struct PhaseClock {
    copy_done: Cell<Option<Instant>>,
    db_done: Cell<Option<Instant>>,
}

/// Point the study's storage row and its pending filesystem triggers at the
/// destination filesystem. Runs inside the command processor's transaction,
/// so undo is the rollback.
///
/// The first statement is a write, so a contended attempt holds no read
/// snapshot and can be re-run inside the same transaction.
pub(crate) struct TierMigrateDatabaseUpdateCommand<'a> {
    description: String,
    location: &'a StorageLocation,
    destination: &'a Filesystem,
    clock: &'a PhaseClock,
    retry: RetryPolicy,
}

impl<'a> TierMigrateDatabaseUpdateCommand<'a> {
    fn new(
        location: &'a StorageLocation,
        destination: &'a Filesystem,
        clock: &'a PhaseClock,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            description: format!(
                "update storage of study {} to {}",
                location.study_instance_uid, destination.description
            ),
            location,
            destination,
            clock,
            retry,
        }
    }

    fn apply(&self, broker: &Broker<'_>) -> Result<usize> {
        let updated = broker.update_storage_location(
            self.location.key,
            &StorageLocationUpdate {
                filesystem_key: Some(self.destination.key),
                ..StorageLocationUpdate::default()
            },
        )?;
        if !updated {
            return Err(Error::NotFound(format!(
                "storage location {}",
                self.location.key
            )));
        }

        broker.retarget_filesystem_queue(
            self.location.key,
            self.location.filesystem_key,
            self.destination.key,
        )
    }
}

impl Command for TierMigrateDatabaseUpdateCommand<'_> {
    fn description(&self) -> &str {
        &self.description
    }

    fn execute(&mut self, broker: &Broker<'_>) -> Result<()> {
        self.clock.copy_done.set(Some(Instant::now()));

        let retargeted = retry_on_deadlock(&self.retry, || self.apply(broker))?;
        tracing::debug!(
            study = %self.location.study_instance_uid,
            retargeted,
            "storage location updated"
        );

        self.clock.db_done.set(Some(Instant::now()));
        Ok(())
    }

    fn undo(&mut self) {
        tracing::debug!(
            study = %self.location.study_instance_uid,
            "storage update rolled back with the transaction"
        );
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Running counters for a copy, with a throttled human-readable progress line.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    expected_files: u64,
    started: DateTime<Utc>,
    interval: Duration,
    last_report: DateTime<Utc>,
    files: u64,
    bytes: u64,
}

impl ProgressTracker {
    pub fn new(expected_files: u64, started: DateTime<Utc>, interval: std::time::Duration) -> Self {
        Self {
            expected_files,
            started,
            interval: Duration::from_std(interval).unwrap_or_else(|_| Duration::days(365)),
            last_report: started,
            files: 0,
            bytes: 0,
        }
    }

    /// Count one copied file. Returns a progress line when the file is a DICOM
    /// file and more than `interval` has passed since the last line.
    pub fn record(&mut self, bytes: u64, is_dicom: bool, now: DateTime<Utc>) -> Option<String> {
        self.files += 1;
        self.bytes += bytes;

        if !is_dicom || now - self.last_report <= self.interval {
            return None;
        }
        self.last_report = now;
        Some(self.describe(now))
    }

    /// Throughput is total bytes over total elapsed time since the start.
    pub fn describe(&self, now: DateTime<Utc>) -> String {
        let mb = self.bytes as f64 / MB;
        let elapsed = (now - self.started).num_milliseconds() as f64 / 1000.0;
        let speed = if elapsed > 0.0 { mb / elapsed } else { 0.0 };
        let since = self.started.format("%Y-%m-%d %H:%M:%S");

        if self.expected_files > 0 {
            let pct = self.files as f64 * 100.0 / self.expected_files as f64;
            format!(
                "{} files moved [{mb:.1}MB] since {since} ({pct:.0}% completed). Speed={speed:.2}MB/s",
                self.files
            )
        } else {
            format!(
                "{} files moved [{mb:.1}MB] since {since}. Speed={speed:.2}MB/s",
                self.files
            )
        }
    }

    pub fn files(&self) -> u64 {
        self.files
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn progress_is_throttled_and_only_on_dicom_files() {
        let mut tracker = ProgressTracker::new(4, start(), std::time::Duration::from_secs(10));

        assert!(tracker.record(100, true, start() + Duration::seconds(5)).is_none());
        assert!(tracker.record(100, false, start() + Duration::seconds(20)).is_none());
        assert!(tracker.record(100, true, start() + Duration::seconds(21)).is_some());
        assert!(tracker.record(100, true, start() + Duration::seconds(25)).is_none());

        assert_eq!(tracker.files(), 4);
        assert_eq!(tracker.bytes(), 400);
    }

    #[test]
    fn progress_line_format() {
        let mut tracker = ProgressTracker::new(4, start(), std::time::Duration::from_secs(1));
        tracker.record(2 * 1024 * 1024, true, start());
        tracker.record(2 * 1024 * 1024, true, start());

        assert_eq!(
            tracker.describe(start() + Duration::seconds(2)),
            "2 files moved [4.0MB] since 2024-03-01 12:00:00 (50% completed). Speed=2.00MB/s"
        );
    }

    #[test]
    fn progress_line_without_expected_count_omits_percentage() {
        let mut tracker = ProgressTracker::new(0, start(), std::time::Duration::from_secs(1));
        tracker.record(1024 * 1024, true, start());
        assert_eq!(
            tracker.describe(start()),
            "1 files moved [1.0MB] since 2024-03-01 12:00:00. Speed=0.00MB/s"
        );
    }
}
