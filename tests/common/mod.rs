//! Shared fixture: a file-backed database, two storage tiers under a temp
//! directory, and one study on the upper tier.

#![allow(dead_code)]

use chrono::{Duration, Utc};
use std::path::PathBuf;
use tempfile::TempDir;
use tierq::config::EngineSettings;
use tierq::engine::{ItemProcessor, Outcome, ProcessContext, process_entry};
use tierq::model::{
    Filesystem, NewQueueEntry, NewStorageLocation, QueueEntry, QueueType, StorageLocation,
    StudyStorageKey,
};
use tierq::stats::{SharedStatistics, StatisticsAggregator};
use tierq::storage::Storage;

pub const STUDY_UID: &str = "1.2.840.113619.2.55.3";
pub const FILE_SIZE: usize = 1024;

pub struct Fixture {
    pub tmp: TempDir,
    pub db_path: PathBuf,
    pub storage: Storage,
    pub progress: Storage,
    pub settings: EngineSettings,
    pub statistics: SharedStatistics,
    pub upper: Filesystem,
    pub lower: Filesystem,
    pub study: StudyStorageKey,
}

impl Fixture {
    /// A study of `files` DICOM files spread over a few series.
    pub fn new(files: usize) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("tierq.db");
        let storage = Storage::open(&db_path).unwrap();
        let progress = storage.reconnect().unwrap();

        let upper = writable(Filesystem::new("fast", tmp.path().join("tier1"), 1));
        let lower = writable(Filesystem::new("archive", tmp.path().join("tier2"), 2));
        std::fs::create_dir_all(&upper.root).unwrap();
        std::fs::create_dir_all(&lower.root).unwrap();
        storage.broker().insert_filesystem(&upper).unwrap();
        storage.broker().insert_filesystem(&lower).unwrap();

        let study = storage
            .broker()
            .insert_storage_location(&NewStorageLocation {
                study_instance_uid: STUDY_UID.into(),
                partition_folder: "ONLINE".into(),
                study_folder: "20240115".into(),
                filesystem_key: upper.key,
            })
            .unwrap();

        let fixture = Self {
            tmp,
            db_path,
            storage,
            progress,
            settings: EngineSettings::default(),
            statistics: StatisticsAggregator::shared(5),
            upper,
            lower,
            study,
        };

        let source = fixture.source_dir();
        for i in 0..files {
            let series = source.join(format!("series-{}", i % 4));
            std::fs::create_dir_all(&series).unwrap();
            std::fs::write(series.join(format!("IM{i:05}.dcm")), vec![b'x'; FILE_SIZE]).unwrap();
        }
        fixture
    }

    pub fn location(&self) -> StorageLocation {
        self.storage
            .broker()
            .get_storage_location(self.study)
            .unwrap()
            .unwrap()
    }

    pub fn source_dir(&self) -> PathBuf {
        self.upper
            .root
            .join("ONLINE")
            .join("20240115")
            .join(STUDY_UID)
    }

    pub fn destination_dir(&self) -> PathBuf {
        self.lower
            .root
            .join("ONLINE")
            .join("20240115")
            .join(STUDY_UID)
    }

    /// Insert a due TierMigrate entry and claim it, as the loop would.
    pub fn claimed_entry(&self, new: NewQueueEntry) -> QueueEntry {
        let inserted = self
            .storage
            .broker()
            .insert_queue_entry(&new.scheduled_at(Utc::now() - Duration::seconds(1)))
            .unwrap();
        let claimed = self
            .storage
            .broker()
            .claim_next("test-node", Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, inserted.id);
        claimed
    }

    pub fn tier_migrate_entry(&self) -> QueueEntry {
        self.claimed_entry(NewQueueEntry::new(QueueType::TierMigrate, self.study))
    }

    pub fn run(&self, processor: &dyn ItemProcessor, entry: &QueueEntry) -> Outcome {
        let ctx = ProcessContext {
            storage: &self.storage,
            progress: &self.progress,
            settings: &self.settings,
            statistics: &self.statistics,
        };
        process_entry(processor, &ctx, entry).unwrap()
    }

    pub fn reload(&self, entry: &QueueEntry) -> QueueEntry {
        self.storage.broker().get_queue_entry(entry.id).unwrap()
    }
}

pub fn count_files(dir: &std::path::Path) -> usize {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}

fn writable(mut fs: Filesystem) -> Filesystem {
    fs.total_bytes = 1 << 40;
    fs.used_bytes = 1 << 30;
    fs
}
