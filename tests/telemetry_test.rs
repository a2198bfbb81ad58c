//! Integration tests for telemetry initialization and span helpers.

use chrono::Utc;
use tierq::model::{QueueEntry, QueueEntryId, QueueStatus, QueueType, StudyStorageKey};
use tierq::telemetry::{TelemetryConfig, init_telemetry, work};

#[test]
fn telemetry_initializes_without_endpoint() {
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "tierq-test".to_string(),
        log_level: "debug".to_string(),
    };
    // Another test in this process may already own the global subscriber.
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
    }
}

#[test]
fn work_span_records_transitions() {
    let now = Utc::now();
    let entry = QueueEntry {
        id: QueueEntryId::new(),
        queue_type: QueueType::TierMigrate,
        study_storage_key: StudyStorageKey::new(),
        status: QueueStatus::InProgress,
        processor_id: Some("node-a".into()),
        scheduled_time: now,
        expiration_time: None,
        failure_count: 0,
        failure_description: None,
        data: None,
        created_at: now,
        updated_at: now,
    };

    let span = work::start_work_span(&entry);
    work::record_state_transition(&span, QueueStatus::Pending, QueueStatus::InProgress);
    work::record_state_transition(&span, QueueStatus::InProgress, QueueStatus::Completed);
}
