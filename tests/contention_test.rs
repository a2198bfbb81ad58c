//! Finalization and the migration's database step under write-lock
//! contention from another connection.

mod common;

use common::{Fixture, count_files};
use std::path::Path;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tierq::config::EngineSettings;
use tierq::engine::processor::{complete_entry, fail_entry};
use tierq::engine::{Outcome, TierMigrateProcessor};
use tierq::model::QueueStatus;

/// Take the write lock from a separate connection and hold it for `hold`.
/// Returns once the lock is held.
fn hold_write_lock(db: &Path, hold: Duration) -> JoinHandle<()> {
    let db = db.to_path_buf();
    let (locked_tx, locked_rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        locked_tx.send(()).unwrap();
        std::thread::sleep(hold);
        conn.execute_batch("COMMIT").unwrap();
    });
    locked_rx.recv().unwrap();
    handle
}

fn no_wait_retries() -> EngineSettings {
    EngineSettings {
        deadlock_retry_min_wait_ms: 0,
        deadlock_retry_max_wait_ms: 0,
        ..EngineSettings::default()
    }
}

#[test]
fn completion_waits_for_a_briefly_held_lock() {
    let fx = Fixture::new(1);
    let entry = fx.tier_migrate_entry();
    let settings = no_wait_retries();

    let holder = hold_write_lock(&fx.db_path, Duration::from_millis(300));
    let start = Instant::now();
    complete_entry(&fx.storage, &entry, &settings).unwrap();
    holder.join().unwrap();

    assert!(start.elapsed() >= Duration::from_millis(250));
    let entry = fx.reload(&entry);
    assert_eq!(entry.status, QueueStatus::Completed);
    assert!(entry.processor_id.is_none());
}

#[test]
fn failure_is_recorded_after_a_briefly_held_lock() {
    let fx = Fixture::new(1);
    let entry = fx.tier_migrate_entry();
    let settings = no_wait_retries();

    let holder = hold_write_lock(&fx.db_path, Duration::from_millis(200));
    fail_entry(&fx.storage, &entry, "copy went wrong", &settings).unwrap();
    holder.join().unwrap();

    let entry = fx.reload(&entry);
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.failure_count, 1);
}

#[test]
fn completion_retries_past_the_busy_timeout() {
    let fx = Fixture::new(1);
    let entry = fx.tier_migrate_entry();
    fx.storage.set_busy_timeout(Duration::from_millis(50)).unwrap();
    let settings = EngineSettings {
        deadlock_max_attempts: 10,
        deadlock_retry_min_wait_ms: 100,
        deadlock_retry_max_wait_ms: 100,
        ..EngineSettings::default()
    };

    let holder = hold_write_lock(&fx.db_path, Duration::from_millis(400));
    complete_entry(&fx.storage, &entry, &settings).unwrap();
    holder.join().unwrap();

    assert_eq!(fx.reload(&entry).status, QueueStatus::Completed);
}

#[test]
fn migration_database_update_outlasts_contention() {
    let mut fx = Fixture::new(20);
    let entry = fx.tier_migrate_entry();
    fx.storage.set_busy_timeout(Duration::from_millis(50)).unwrap();
    fx.settings = EngineSettings {
        deadlock_max_attempts: 20,
        deadlock_retry_min_wait_ms: 100,
        deadlock_retry_max_wait_ms: 100,
        ..EngineSettings::default()
    };

    // Held across the copy and into the database step.
    let holder = hold_write_lock(&fx.db_path, Duration::from_millis(600));
    let outcome = fx.run(&TierMigrateProcessor, &entry);
    holder.join().unwrap();

    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(fx.location().filesystem_key, fx.lower.key);
    assert_eq!(count_files(&fx.destination_dir()), 20);
    assert!(!fx.source_dir().exists());
    assert_eq!(fx.reload(&entry).status, QueueStatus::Completed);
}
