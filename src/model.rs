//! Core data model.
//!
//! A queue entry is a persisted unit of deferred work against one study. The
//! study's physical home is described by its storage location, which points at
//! one filesystem in a ranked set of storage tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

macro_rules! entity_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

entity_key!(
    /// Identity of a work queue entry.
    QueueEntryId
);
entity_key!(
    /// Identity of a study's storage record. The logical resource a queue entry acts on.
    StudyStorageKey
);
entity_key!(
    /// Identity of a storage filesystem.
    FilesystemKey
);

// ---------------------------------------------------------------------------
// Queue status
// ---------------------------------------------------------------------------

/// Lifecycle status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for its scheduled time.
    Pending,
    /// Claimed by a processor.
    InProgress,
    /// Batch finished, waiting for more work or expiration.
    Idle,
    /// Done. Kept until expiration.
    Completed,
    /// Gave up. Kept for operator inspection until expiration.
    Failed,
}

impl QueueStatus {
    pub fn can_transition_to(self, to: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Pending)     // postponed or reset after a crash
                | (InProgress, Idle)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Idle, InProgress)
                | (Pending, Failed) // failed during startup recovery
        )
    }

    /// Active entries block conflicting work on the same study.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            QueueStatus::Pending | QueueStatus::InProgress | QueueStatus::Idle
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InProgress => "in_progress",
            QueueStatus::Idle => "idle",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "in_progress" => Ok(QueueStatus::InProgress),
            "idle" => Ok(QueueStatus::Idle),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            _ => Err(Error::Other(format!("unknown queue status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue type
// ---------------------------------------------------------------------------

/// What kind of work a queue entry asks for. Determines the item processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    TierMigrate,
    StudyProcess,
    ReconcileStudy,
    ProcessDuplicate,
    ReconcilePostProcess,
    ReconcileCleanup,
    ReprocessStudy,
    DeleteStudy,
    CompressStudy,
}

impl QueueType {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueType::TierMigrate => "tier_migrate",
            QueueType::StudyProcess => "study_process",
            QueueType::ReconcileStudy => "reconcile_study",
            QueueType::ProcessDuplicate => "process_duplicate",
            QueueType::ReconcilePostProcess => "reconcile_post_process",
            QueueType::ReconcileCleanup => "reconcile_cleanup",
            QueueType::ReprocessStudy => "reprocess_study",
            QueueType::DeleteStudy => "delete_study",
            QueueType::CompressStudy => "compress_study",
        }
    }
}

impl std::fmt::Display for QueueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tier_migrate" => Ok(QueueType::TierMigrate),
            "study_process" => Ok(QueueType::StudyProcess),
            "reconcile_study" => Ok(QueueType::ReconcileStudy),
            "process_duplicate" => Ok(QueueType::ProcessDuplicate),
            "reconcile_post_process" => Ok(QueueType::ReconcilePostProcess),
            "reconcile_cleanup" => Ok(QueueType::ReconcileCleanup),
            "reprocess_study" => Ok(QueueType::ReprocessStudy),
            "delete_study" => Ok(QueueType::DeleteStudy),
            "compress_study" => Ok(QueueType::CompressStudy),
            _ => Err(Error::Other(format!("unknown queue type: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue entry
// ---------------------------------------------------------------------------

/// A persisted unit of deferred work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub queue_type: QueueType,
    /// The study this entry acts on.
    pub study_storage_key: StudyStorageKey,
    pub status: QueueStatus,
    /// Set while a processor owns the entry.
    pub processor_id: Option<String>,
    pub scheduled_time: DateTime<Utc>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub failure_count: u32,
    /// Failure reason, or a progress line while the entry is running.
    pub failure_description: Option<String>,
    /// Opaque per-type state. See `engine::state`.
    pub data: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Builder for inserting a queue entry.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub(crate) queue_type: QueueType,
    pub(crate) study_storage_key: StudyStorageKey,
    pub(crate) status: QueueStatus,
    pub(crate) scheduled_time: DateTime<Utc>,
    pub(crate) expiration_time: Option<DateTime<Utc>>,
    pub(crate) data: Option<String>,
}

impl NewQueueEntry {
    pub fn new(queue_type: QueueType, study_storage_key: StudyStorageKey) -> Self {
        Self {
            queue_type,
            study_storage_key,
            status: QueueStatus::Pending,
            scheduled_time: Utc::now(),
            expiration_time: None,
            data: None,
        }
    }

    pub fn scheduled_at(mut self, time: DateTime<Utc>) -> Self {
        self.scheduled_time = time;
        self
    }

    pub fn expires_at(mut self, time: DateTime<Utc>) -> Self {
        self.expiration_time = Some(time);
        self
    }

    pub fn status(mut self, status: QueueStatus) -> Self {
        self.status = status;
        self
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Studies and filesystems
// ---------------------------------------------------------------------------

/// What the queue as a whole intends to do with a study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStudyState {
    Idle,
    MigrationScheduled,
    ReprocessScheduled,
    DeleteScheduled,
}

impl QueueStudyState {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStudyState::Idle => "idle",
            QueueStudyState::MigrationScheduled => "migration_scheduled",
            QueueStudyState::ReprocessScheduled => "reprocess_scheduled",
            QueueStudyState::DeleteScheduled => "delete_scheduled",
        }
    }
}

impl FromStr for QueueStudyState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(QueueStudyState::Idle),
            "migration_scheduled" => Ok(QueueStudyState::MigrationScheduled),
            "reprocess_scheduled" => Ok(QueueStudyState::ReprocessScheduled),
            "delete_scheduled" => Ok(QueueStudyState::DeleteScheduled),
            _ => Err(Error::Other(format!("unknown queue study state: {s}"))),
        }
    }
}

/// Where a study physically lives. One authoritative row per study; a tier
/// move mutates `filesystem_key` in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageLocation {
    pub key: StudyStorageKey,
    pub study_instance_uid: String,
    pub partition_folder: String,
    pub study_folder: String,
    pub filesystem_key: FilesystemKey,
    /// Root of `filesystem_key`, joined in when the row is loaded.
    pub filesystem_root: PathBuf,
    /// Tier rank of `filesystem_key`, joined in when the row is loaded.
    pub filesystem_tier: i32,
    pub queue_study_state: QueueStudyState,
}

impl StorageLocation {
    /// Layout of a study below any filesystem root.
    pub fn relative_path(&self) -> PathBuf {
        Path::new(&self.partition_folder)
            .join(&self.study_folder)
            .join(&self.study_instance_uid)
    }

    /// `<root>/<partition>/<study-folder>/<study-uid>` on the current filesystem.
    pub fn study_path(&self) -> PathBuf {
        self.filesystem_root.join(self.relative_path())
    }
}

/// Parameters for registering a study's storage.
#[derive(Debug, Clone)]
pub struct NewStorageLocation {
    pub study_instance_uid: String,
    pub partition_folder: String,
    pub study_folder: String,
    pub filesystem_key: FilesystemKey,
}

/// A storage filesystem. Higher `tier` means a lower (cheaper, slower) tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filesystem {
    pub key: FilesystemKey,
    pub description: String,
    pub root: PathBuf,
    pub tier: i32,
    pub enabled: bool,
    pub read_only: bool,
    /// Usage percentage above which the filesystem accepts no new studies.
    pub high_watermark: f64,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl Filesystem {
    pub fn new(description: impl Into<String>, root: impl Into<PathBuf>, tier: i32) -> Self {
        Self {
            key: FilesystemKey::new(),
            description: description.into(),
            root: root.into(),
            tier,
            enabled: true,
            read_only: false,
            high_watermark: 90.0,
            total_bytes: 0,
            used_bytes: 0,
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }

    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.used_bytes as f64 * 100.0 / self.total_bytes as f64
    }

    /// Enabled, not read-only, and below its high watermark.
    pub fn is_writable(&self) -> bool {
        self.enabled && !self.read_only && self.usage_percent() < self.high_watermark
    }
}

// ---------------------------------------------------------------------------
// Filesystem queue and integrity queue
// ---------------------------------------------------------------------------

/// Filesystem-level triggers. A scheduler turns due rows into work queue entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemQueueType {
    TierMigrate,
    DeleteStudy,
    PurgeStudy,
    LosslessCompress,
}

impl FilesystemQueueType {
    pub fn as_str(self) -> &'static str {
        match self {
            FilesystemQueueType::TierMigrate => "tier_migrate",
            FilesystemQueueType::DeleteStudy => "delete_study",
            FilesystemQueueType::PurgeStudy => "purge_study",
            FilesystemQueueType::LosslessCompress => "lossless_compress",
        }
    }
}

impl FromStr for FilesystemQueueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tier_migrate" => Ok(FilesystemQueueType::TierMigrate),
            "delete_study" => Ok(FilesystemQueueType::DeleteStudy),
            "purge_study" => Ok(FilesystemQueueType::PurgeStudy),
            "lossless_compress" => Ok(FilesystemQueueType::LosslessCompress),
            _ => Err(Error::Other(format!("unknown filesystem queue type: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemQueueEntry {
    pub id: i64,
    pub queue_type: FilesystemQueueType,
    pub study_storage_key: StudyStorageKey,
    pub filesystem_key: FilesystemKey,
    pub scheduled_time: DateTime<Utc>,
}

/// An unresolved reconciliation for a study. Any row blocks tier moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityEntry {
    pub id: i64,
    pub study_storage_key: StudyStorageKey,
    pub reason: String,
    pub inserted_at: DateTime<Utc>,
}
