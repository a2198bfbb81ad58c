//! SQLite storage layer: the persistence broker.
//!
//! Single source of truth for queue entries, study storage locations,
//! filesystems, filesystem triggers, reconciliation entries and alerts.
//!
//! Typed find/update/insert/delete operations live on [`Broker`], a borrowed
//! view over a connection. A broker is obtained either from [`Storage`]
//! (auto-commit) or from an [`UpdateContext`], which wraps a transaction that
//! must be committed explicitly and rolls back when dropped.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{
    Connection, OptionalExtension, Transaction, TransactionBehavior, params, params_from_iter,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::alert::{Alert, AlertContext, AlertLevel};
use crate::error::{Error, Result};
use crate::model::*;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the database lives, so additional connections can be opened to it.
#[derive(Debug, Clone)]
enum DbLocation {
    File(PathBuf),
    /// Shared-cache in-memory database, alive while any connection is open.
    Memory(String),
}

/// Storage backend. Owns one SQLite connection.
pub struct Storage {
    conn: Connection,
    location: DbLocation,
}

impl Storage {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        let storage = Self {
            conn,
            location: DbLocation::File(path),
        };
        storage.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        storage.init()?;
        Ok(storage)
    }

    /// Create a uniquely named in-memory database (for testing).
    ///
    /// The database is shared-cache so [`Storage::reconnect`] reaches the same
    /// data.
    pub fn in_memory() -> Result<Self> {
        let uri = format!("file:tierq-{}?mode=memory&cache=shared", Uuid::new_v4());
        let conn = Connection::open(&uri)?;
        let storage = Self {
            conn,
            location: DbLocation::Memory(uri),
        };
        storage.init()?;
        Ok(storage)
    }

    /// Open another connection to the same database.
    pub fn reconnect(&self) -> Result<Self> {
        self.connector().connect()
    }

    /// A thread-safe handle for opening more connections to this database.
    ///
    /// An in-memory database lives only as long as one of its connections,
    /// so keep this `Storage` alive while the connector is in use.
    pub fn connector(&self) -> Connector {
        Connector {
            location: self.location.clone(),
        }
    }

    /// How long a statement waits on another connection's lock before
    /// failing with `SQLITE_BUSY`.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    fn configure(&self) -> Result<()> {
        self.set_busy_timeout(BUSY_TIMEOUT)?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(())
    }

    fn init(&self) -> Result<()> {
        self.configure()?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS filesystem (
                key             TEXT PRIMARY KEY,
                description     TEXT NOT NULL,
                root            TEXT NOT NULL,
                tier            INTEGER NOT NULL,
                enabled         INTEGER NOT NULL DEFAULT 1,
                read_only       INTEGER NOT NULL DEFAULT 0,
                high_watermark  REAL NOT NULL DEFAULT 90.0,
                total_bytes     INTEGER NOT NULL DEFAULT 0,
                used_bytes      INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS study_storage (
                key                 TEXT PRIMARY KEY,
                study_instance_uid  TEXT NOT NULL,
                partition_folder    TEXT NOT NULL,
                study_folder        TEXT NOT NULL,
                filesystem_key      TEXT NOT NULL REFERENCES filesystem(key),
                queue_study_state   TEXT NOT NULL DEFAULT 'idle',
                updated_at          TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_study_uid
                ON study_storage(partition_folder, study_instance_uid);

            CREATE TABLE IF NOT EXISTS work_queue (
                id                  TEXT PRIMARY KEY,
                queue_type          TEXT NOT NULL,
                study_storage_key   TEXT NOT NULL REFERENCES study_storage(key),
                status              TEXT NOT NULL,
                processor_id        TEXT,
                scheduled_time      TEXT NOT NULL,
                expiration_time     TEXT,
                failure_count       INTEGER NOT NULL DEFAULT 0,
                failure_description TEXT,
                data                TEXT,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_wq_due ON work_queue(status, scheduled_time);
            CREATE INDEX IF NOT EXISTS idx_wq_study ON work_queue(study_storage_key);

            CREATE TABLE IF NOT EXISTS filesystem_queue (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_type          TEXT NOT NULL,
                study_storage_key   TEXT NOT NULL REFERENCES study_storage(key),
                filesystem_key      TEXT NOT NULL REFERENCES filesystem(key),
                scheduled_time      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_fsq_study ON filesystem_queue(study_storage_key);

            CREATE TABLE IF NOT EXISTS study_integrity_queue (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                study_storage_key   TEXT NOT NULL REFERENCES study_storage(key),
                reason              TEXT NOT NULL,
                inserted_at         TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alert (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                level       TEXT NOT NULL,
                source      TEXT NOT NULL,
                code        INTEGER NOT NULL,
                message     TEXT NOT NULL,
                context     TEXT,
                raised_at   TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    /// Auto-commit broker on this connection.
    pub fn broker(&self) -> Broker<'_> {
        Broker { conn: &self.conn }
    }

    /// Begin a deferred transaction. Nothing is written until
    /// [`UpdateContext::commit`], and the write lock is only taken by the
    /// first write, so long-running work can hold the context open.
    pub fn open_update_context(&self) -> Result<UpdateContext<'_>> {
        Ok(UpdateContext {
            tx: self.conn.unchecked_transaction()?,
        })
    }

    /// Begin a transaction that takes the write lock up front.
    ///
    /// A deferred transaction that reads before it writes gets `SQLITE_BUSY`
    /// at once when another writer holds the lock; this one waits out the
    /// busy timeout instead. Keep it short.
    pub fn open_write_context(&self) -> Result<UpdateContext<'_>> {
        Ok(UpdateContext {
            tx: Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?,
        })
    }

    /// Execute a closure within a write transaction.
    ///
    /// The transaction commits if the closure returns Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Broker<'_>) -> Result<T>,
    {
        let ctx = self.open_write_context()?;
        let result = f(&ctx.broker())?;
        ctx.commit()?;
        Ok(result)
    }
}

/// Opens connections to one database. Cheap to clone, `Send` and `Sync`.
#[derive(Debug, Clone)]
pub struct Connector {
    location: DbLocation,
}

impl Connector {
    /// Open a connection to an already initialized database.
    pub fn connect(&self) -> Result<Storage> {
        let conn = match &self.location {
            DbLocation::File(path) => Connection::open(path)?,
            DbLocation::Memory(uri) => Connection::open(uri)?,
        };
        let storage = Storage {
            conn,
            location: self.location.clone(),
        };
        storage.configure()?;
        Ok(storage)
    }
}

/// An open transaction. Dropping it without [`commit`](Self::commit) rolls back.
pub struct UpdateContext<'c> {
    tx: Transaction<'c>,
}

impl UpdateContext<'_> {
    pub fn broker(&self) -> Broker<'_> {
        Broker { conn: &self.tx }
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> Result<()> {
        self.tx.rollback()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Criteria and update columns
// ---------------------------------------------------------------------------

/// Search criteria for queue entries. Empty fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct QueueCriteria {
    pub study_storage_key: Option<StudyStorageKey>,
    pub types: Vec<QueueType>,
    pub statuses: Vec<QueueStatus>,
    /// Leave this entry out of the result.
    pub exclude: Option<QueueEntryId>,
    pub limit: Option<u32>,
}

impl QueueCriteria {
    pub fn for_study(key: StudyStorageKey) -> Self {
        Self {
            study_storage_key: Some(key),
            ..Self::default()
        }
    }
}

/// Columns to change on a queue entry. `None` leaves a column untouched; the
/// nested options on nullable columns allow clearing them.
#[derive(Debug, Clone, Default)]
pub struct QueueUpdate {
    pub status: Option<QueueStatus>,
    pub processor_id: Option<Option<String>>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub expiration_time: Option<Option<DateTime<Utc>>>,
    pub failure_count: Option<u32>,
    pub failure_description: Option<Option<String>>,
    pub data: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct StorageLocationUpdate {
    pub filesystem_key: Option<FilesystemKey>,
    pub queue_study_state: Option<QueueStudyState>,
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Typed operations over one connection or transaction.
#[derive(Clone, Copy)]
pub struct Broker<'c> {
    conn: &'c Connection,
}

const QUEUE_COLUMNS: &str = "id, queue_type, study_storage_key, status, processor_id, \
    scheduled_time, expiration_time, failure_count, failure_description, data, created_at, updated_at";

const FILESYSTEM_COLUMNS: &str =
    "key, description, root, tier, enabled, read_only, high_watermark, total_bytes, used_bytes";

impl Broker<'_> {
    // -----------------------------------------------------------------------
    // Work queue
    // -----------------------------------------------------------------------

    pub fn insert_queue_entry(&self, new: &NewQueueEntry) -> Result<QueueEntry> {
        let id = QueueEntryId::new();
        let now = ts(&Utc::now());
        self.conn.execute(
            "INSERT INTO work_queue (
                id, queue_type, study_storage_key, status, scheduled_time,
                expiration_time, failure_count, data, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?8)",
            params![
                id.to_string(),
                new.queue_type.as_str(),
                new.study_storage_key.to_string(),
                new.status.as_str(),
                ts(&new.scheduled_time),
                new.expiration_time.as_ref().map(ts),
                new.data,
                now,
            ],
        )?;
        self.get_queue_entry(id)
    }

    pub fn get_queue_entry(&self, id: QueueEntryId) -> Result<QueueEntry> {
        self.conn
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM work_queue WHERE id = ?1"),
                params![id.to_string()],
                QueueEntryRow::from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("queue entry {id}")))?
            .try_into_entry()
    }

    pub fn find_queue_entries(&self, criteria: &QueueCriteria) -> Result<Vec<QueueEntry>> {
        let mut sql = format!("SELECT {QUEUE_COLUMNS} FROM work_queue WHERE 1 = 1");
        let mut args: Vec<Value> = Vec::new();

        if let Some(key) = criteria.study_storage_key {
            args.push(Value::Text(key.to_string()));
            sql.push_str(&format!(" AND study_storage_key = ?{}", args.len()));
        }
        if let Some(id) = criteria.exclude {
            args.push(Value::Text(id.to_string()));
            sql.push_str(&format!(" AND id <> ?{}", args.len()));
        }
        if !criteria.types.is_empty() {
            let names: Vec<&str> = criteria.types.iter().map(|t| t.as_str()).collect();
            sql.push_str(&in_clause("queue_type", &names, &mut args));
        }
        if !criteria.statuses.is_empty() {
            let names: Vec<&str> = criteria.statuses.iter().map(|s| s.as_str()).collect();
            sql.push_str(&in_clause("status", &names, &mut args));
        }
        sql.push_str(" ORDER BY scheduled_time ASC, created_at ASC");
        if let Some(limit) = criteria.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), QueueEntryRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(QueueEntryRow::try_into_entry).collect()
    }

    pub fn find_one_queue_entry(&self, criteria: &QueueCriteria) -> Result<Option<QueueEntry>> {
        let criteria = QueueCriteria {
            limit: Some(1),
            ..criteria.clone()
        };
        Ok(self.find_queue_entries(&criteria)?.into_iter().next())
    }

    /// Apply `update` to an entry. Returns false if no row matched.
    ///
    /// A status change is validated against [`QueueStatus::can_transition_to`].
    pub fn update_queue_entry(&self, id: QueueEntryId, update: &QueueUpdate) -> Result<bool> {
        if let Some(to) = update.status {
            let Some(from) = self.queue_status(id)? else {
                return Ok(false);
            };
            if from != to && !from.can_transition_to(to) {
                return Err(Error::InvalidTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
        }

        let mut sets: Vec<String> = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        let mut set = |column: &str, value: Value| {
            args.push(value);
            sets.push(format!("{column} = ?{}", args.len()));
        };

        if let Some(status) = update.status {
            set("status", text(status.as_str()));
        }
        if let Some(ref processor_id) = update.processor_id {
            set("processor_id", opt_text(processor_id.as_deref()));
        }
        if let Some(ref time) = update.scheduled_time {
            set("scheduled_time", Value::Text(ts(time)));
        }
        if let Some(ref time) = update.expiration_time {
            set("expiration_time", opt_text(time.as_ref().map(ts).as_deref()));
        }
        if let Some(count) = update.failure_count {
            set("failure_count", Value::Integer(i64::from(count)));
        }
        if let Some(ref description) = update.failure_description {
            set("failure_description", opt_text(description.as_deref()));
        }
        if let Some(ref data) = update.data {
            set("data", opt_text(data.as_deref()));
        }
        set("updated_at", Value::Text(ts(&Utc::now())));

        args.push(Value::Text(id.to_string()));
        let sql = format!(
            "UPDATE work_queue SET {} WHERE id = ?{}",
            sets.join(", "),
            args.len()
        );
        let changed = self.conn.execute(&sql, params_from_iter(args.iter()))?;
        Ok(changed > 0)
    }

    pub fn delete_queue_entry(&self, id: QueueEntryId) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM work_queue WHERE id = ?1", params![id.to_string()])?;
        Ok(changed > 0)
    }

    fn queue_status(&self, id: QueueEntryId) -> Result<Option<QueueStatus>> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM work_queue WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        status.map(|s| s.parse()).transpose()
    }

    /// Stamp the oldest due Pending or Idle entry as InProgress for `processor_id`.
    ///
    /// Selection and stamping happen in one statement, so two processors can
    /// never claim the same entry.
    pub fn claim_next(&self, processor_id: &str, now: DateTime<Utc>) -> Result<Option<QueueEntry>> {
        let now = ts(&now);
        let claimed: Option<String> = self
            .conn
            .query_row(
                "UPDATE work_queue
                 SET status = 'in_progress', processor_id = ?1, updated_at = ?2
                 WHERE id = (
                     SELECT id FROM work_queue
                     WHERE status IN ('pending', 'idle') AND scheduled_time <= ?2
                     ORDER BY scheduled_time ASC, created_at ASC
                     LIMIT 1
                 )
                 RETURNING id",
                params![processor_id, now],
                |row| row.get(0),
            )
            .optional()?;

        claimed
            .map(|id| self.get_queue_entry(parse_key(&id)?))
            .transpose()
    }

    /// Recover entries this processor left InProgress when it last stopped.
    ///
    /// Each one has its failure count bumped; below `max_failure_count` it goes
    /// back to Pending (due now, expiring at `retry_expiration`), otherwise it
    /// is Failed and expires immediately. Returns the modified entries.
    pub fn reset_in_progress(
        &self,
        processor_id: &str,
        now: DateTime<Utc>,
        retry_expiration: DateTime<Utc>,
        max_failure_count: u32,
    ) -> Result<Vec<QueueEntry>> {
        let stale = self.find_queue_entries(&QueueCriteria {
            statuses: vec![QueueStatus::InProgress],
            ..QueueCriteria::default()
        })?;

        let mut modified = Vec::new();
        for entry in stale
            .into_iter()
            .filter(|e| e.processor_id.as_deref() == Some(processor_id))
        {
            let failure_count = entry.failure_count + 1;
            let update = if failure_count >= max_failure_count {
                QueueUpdate {
                    status: Some(QueueStatus::Failed),
                    processor_id: Some(None),
                    scheduled_time: Some(now),
                    expiration_time: Some(Some(now)),
                    failure_count: Some(failure_count),
                    ..QueueUpdate::default()
                }
            } else {
                QueueUpdate {
                    status: Some(QueueStatus::Pending),
                    processor_id: Some(None),
                    scheduled_time: Some(now),
                    expiration_time: Some(Some(retry_expiration)),
                    failure_count: Some(failure_count),
                    ..QueueUpdate::default()
                }
            };
            self.update_queue_entry(entry.id, &update)?;
            modified.push(self.get_queue_entry(entry.id)?);
        }
        Ok(modified)
    }

    /// Delete Completed and Failed entries whose expiration has passed.
    ///
    /// A completed entry without an expiration is purged once its scheduled
    /// time has passed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM work_queue
             WHERE (status = 'completed' AND COALESCE(expiration_time, scheduled_time) <= ?1)
                OR (status = 'failed' AND expiration_time IS NOT NULL AND expiration_time <= ?1)",
            params![ts(&now)],
        )?;
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Study storage
    // -----------------------------------------------------------------------

    pub fn insert_storage_location(&self, new: &NewStorageLocation) -> Result<StudyStorageKey> {
        let key = StudyStorageKey::new();
        self.conn.execute(
            "INSERT INTO study_storage (
                key, study_instance_uid, partition_folder, study_folder,
                filesystem_key, queue_study_state, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'idle', ?6)",
            params![
                key.to_string(),
                new.study_instance_uid,
                new.partition_folder,
                new.study_folder,
                new.filesystem_key.to_string(),
                ts(&Utc::now()),
            ],
        )?;
        Ok(key)
    }

    pub fn get_storage_location(&self, key: StudyStorageKey) -> Result<Option<StorageLocation>> {
        let row = self
            .conn
            .query_row(
                "SELECT s.key, s.study_instance_uid, s.partition_folder, s.study_folder,
                        s.filesystem_key, f.root, f.tier, s.queue_study_state
                 FROM study_storage s JOIN filesystem f ON f.key = s.filesystem_key
                 WHERE s.key = ?1",
                params![key.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i32>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(key, uid, partition, folder, fs_key, root, tier, queue_state)| {
                Ok(StorageLocation {
                    key: parse_key(&key)?,
                    study_instance_uid: uid,
                    partition_folder: partition,
                    study_folder: folder,
                    filesystem_key: parse_key(&fs_key)?,
                    filesystem_root: PathBuf::from(root),
                    filesystem_tier: tier,
                    queue_study_state: queue_state.parse()?,
                })
            },
        )
        .transpose()
    }

    /// Mutate the authoritative storage row in place.
    pub fn update_storage_location(
        &self,
        key: StudyStorageKey,
        update: &StorageLocationUpdate,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE study_storage
             SET filesystem_key = COALESCE(?1, filesystem_key),
                 queue_study_state = COALESCE(?2, queue_study_state),
                 updated_at = ?3
             WHERE key = ?4",
            params![
                update.filesystem_key.map(|k| k.to_string()),
                update.queue_study_state.map(|s| s.as_str()),
                ts(&Utc::now()),
                key.to_string(),
            ],
        )?;
        Ok(changed > 0)
    }

    // -----------------------------------------------------------------------
    // Filesystems
    // -----------------------------------------------------------------------

    pub fn insert_filesystem(&self, fs: &Filesystem) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO filesystem ({FILESYSTEM_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                fs.key.to_string(),
                fs.description,
                fs.root.to_string_lossy().into_owned(),
                fs.tier,
                fs.enabled,
                fs.read_only,
                fs.high_watermark,
                to_i64(fs.total_bytes),
                to_i64(fs.used_bytes),
            ],
        )?;
        Ok(())
    }

    pub fn get_filesystem(&self, key: FilesystemKey) -> Result<Option<Filesystem>> {
        self.conn
            .query_row(
                &format!("SELECT {FILESYSTEM_COLUMNS} FROM filesystem WHERE key = ?1"),
                params![key.to_string()],
                FilesystemRow::from_row,
            )
            .optional()?
            .map(FilesystemRow::try_into_filesystem)
            .transpose()
    }

    pub fn list_filesystems(&self) -> Result<Vec<Filesystem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FILESYSTEM_COLUMNS} FROM filesystem ORDER BY tier ASC, description ASC"
        ))?;
        let rows = stmt
            .query_map([], FilesystemRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(FilesystemRow::try_into_filesystem)
            .collect()
    }

    /// Record the capacity figures reported by the filesystem monitor.
    pub fn update_filesystem_usage(
        &self,
        key: FilesystemKey,
        total_bytes: u64,
        used_bytes: u64,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE filesystem SET total_bytes = ?1, used_bytes = ?2 WHERE key = ?3",
            params![to_i64(total_bytes), to_i64(used_bytes), key.to_string()],
        )?;
        Ok(changed > 0)
    }

    // -----------------------------------------------------------------------
    // Filesystem queue
    // -----------------------------------------------------------------------

    pub fn insert_filesystem_queue(
        &self,
        queue_type: FilesystemQueueType,
        study_storage_key: StudyStorageKey,
        filesystem_key: FilesystemKey,
        scheduled_time: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO filesystem_queue (queue_type, study_storage_key, filesystem_key, scheduled_time)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                queue_type.as_str(),
                study_storage_key.to_string(),
                filesystem_key.to_string(),
                ts(&scheduled_time),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn find_filesystem_queue(
        &self,
        study_storage_key: StudyStorageKey,
        queue_type: Option<FilesystemQueueType>,
    ) -> Result<Vec<FilesystemQueueEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, queue_type, study_storage_key, filesystem_key, scheduled_time
             FROM filesystem_queue
             WHERE study_storage_key = ?1 AND (?2 IS NULL OR queue_type = ?2)
             ORDER BY scheduled_time ASC",
        )?;
        let rows = stmt
            .query_map(
                params![study_storage_key.to_string(), queue_type.map(|t| t.as_str())],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, queue_type, study, fs, scheduled)| {
                Ok(FilesystemQueueEntry {
                    id,
                    queue_type: queue_type.parse()?,
                    study_storage_key: parse_key(&study)?,
                    filesystem_key: parse_key(&fs)?,
                    scheduled_time: parse_ts(&scheduled)?,
                })
            })
            .collect()
    }

    pub fn delete_filesystem_queue(
        &self,
        study_storage_key: StudyStorageKey,
        queue_type: FilesystemQueueType,
    ) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM filesystem_queue WHERE study_storage_key = ?1 AND queue_type = ?2",
            params![study_storage_key.to_string(), queue_type.as_str()],
        )?;
        Ok(deleted)
    }

    /// Point a study's filesystem triggers at its new filesystem.
    pub fn retarget_filesystem_queue(
        &self,
        study_storage_key: StudyStorageKey,
        from: FilesystemKey,
        to: FilesystemKey,
    ) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE filesystem_queue SET filesystem_key = ?1
             WHERE study_storage_key = ?2 AND filesystem_key = ?3",
            params![to.to_string(), study_storage_key.to_string(), from.to_string()],
        )?;
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Study integrity queue
    // -----------------------------------------------------------------------

    pub fn insert_integrity_entry(
        &self,
        study_storage_key: StudyStorageKey,
        reason: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO study_integrity_queue (study_storage_key, reason, inserted_at)
             VALUES (?1, ?2, ?3)",
            params![study_storage_key.to_string(), reason, ts(&Utc::now())],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn find_integrity_entries(
        &self,
        study_storage_key: StudyStorageKey,
    ) -> Result<Vec<IntegrityEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, study_storage_key, reason, inserted_at
             FROM study_integrity_queue WHERE study_storage_key = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![study_storage_key.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, study, reason, inserted)| {
                Ok(IntegrityEntry {
                    id,
                    study_storage_key: parse_key(&study)?,
                    reason,
                    inserted_at: parse_ts(&inserted)?,
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    pub fn insert_alert(&self, alert: &Alert) -> Result<i64> {
        let context = alert
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            "INSERT INTO alert (level, source, code, message, context, raised_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                alert.level.as_str(),
                alert.source,
                alert.code,
                alert.message,
                context,
                ts(&alert.raised_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent alerts first.
    pub fn list_alerts(&self, limit: u32) -> Result<Vec<Alert>> {
        let mut stmt = self.conn.prepare(
            "SELECT level, source, code, message, context, raised_at
             FROM alert ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(level, source, code, message, context, raised_at)| {
                Ok(Alert {
                    level: level.parse::<AlertLevel>()?,
                    source,
                    code,
                    message,
                    context: context
                        .map(|c| serde_json::from_str::<AlertContext>(&c))
                        .transpose()?,
                    raised_at: parse_ts(&raised_at)?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

struct QueueEntryRow {
    id: String,
    queue_type: String,
    study_storage_key: String,
    status: String,
    processor_id: Option<String>,
    scheduled_time: String,
    expiration_time: Option<String>,
    failure_count: u32,
    failure_description: Option<String>,
    data: Option<String>,
    created_at: String,
    updated_at: String,
}

impl QueueEntryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            queue_type: row.get("queue_type")?,
            study_storage_key: row.get("study_storage_key")?,
            status: row.get("status")?,
            processor_id: row.get("processor_id")?,
            scheduled_time: row.get("scheduled_time")?,
            expiration_time: row.get("expiration_time")?,
            failure_count: row.get("failure_count")?,
            failure_description: row.get("failure_description")?,
            data: row.get("data")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn try_into_entry(self) -> Result<QueueEntry> {
        Ok(QueueEntry {
            id: parse_key(&self.id)?,
            queue_type: self.queue_type.parse()?,
            study_storage_key: parse_key(&self.study_storage_key)?,
            status: self.status.parse()?,
            processor_id: self.processor_id,
            scheduled_time: parse_ts(&self.scheduled_time)?,
            expiration_time: self.expiration_time.as_deref().map(parse_ts).transpose()?,
            failure_count: self.failure_count,
            failure_description: self.failure_description,
            data: self.data,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct FilesystemRow {
    key: String,
    description: String,
    root: String,
    tier: i32,
    enabled: bool,
    read_only: bool,
    high_watermark: f64,
    total_bytes: i64,
    used_bytes: i64,
}

impl FilesystemRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get("key")?,
            description: row.get("description")?,
            root: row.get("root")?,
            tier: row.get("tier")?,
            enabled: row.get("enabled")?,
            read_only: row.get("read_only")?,
            high_watermark: row.get("high_watermark")?,
            total_bytes: row.get("total_bytes")?,
            used_bytes: row.get("used_bytes")?,
        })
    }

    fn try_into_filesystem(self) -> Result<Filesystem> {
        Ok(Filesystem {
            key: parse_key(&self.key)?,
            description: self.description,
            root: PathBuf::from(self.root),
            tier: self.tier,
            enabled: self.enabled,
            read_only: self.read_only,
            high_watermark: self.high_watermark,
            total_bytes: self.total_bytes.max(0) as u64,
            used_bytes: self.used_bytes.max(0) as u64,
        })
    }
}

/// Fixed-width UTC timestamps, so text order is time order.
pub(crate) fn ts(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("invalid timestamp {s}: {e}")))
}

fn parse_key<K>(s: &str) -> Result<K>
where
    K: FromStr<Err = uuid::Error>,
{
    s.parse()
        .map_err(|e| Error::Other(format!("invalid key {s}: {e}")))
}

fn in_clause(column: &str, values: &[&str], args: &mut Vec<Value>) -> String {
    let placeholders: Vec<String> = values
        .iter()
        .map(|v| {
            args.push(text(v));
            format!("?{}", args.len())
        })
        .collect();
    format!(" AND {column} IN ({})", placeholders.join(", "))
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn opt_text(s: Option<&str>) -> Value {
    s.map_or(Value::Null, text)
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn seed_study(storage: &Storage) -> (FilesystemKey, StudyStorageKey) {
        let fs = Filesystem::new("fast", "/fs/fast", 1);
        let broker = storage.broker();
        broker.insert_filesystem(&fs).unwrap();
        let study = broker
            .insert_storage_location(&NewStorageLocation {
                study_instance_uid: "1.2.3".into(),
                partition_folder: "ONLINE".into(),
                study_folder: "20240101".into(),
                filesystem_key: fs.key,
            })
            .unwrap();
        (fs.key, study)
    }

    #[test]
    fn queue_entry_survives_store_and_reload() {
        let storage = Storage::in_memory().unwrap();
        let (_, study) = seed_study(&storage);

        let inserted = storage
            .broker()
            .insert_queue_entry(&NewQueueEntry::new(QueueType::TierMigrate, study).data("{}"))
            .unwrap();
        let loaded = storage.broker().get_queue_entry(inserted.id).unwrap();

        assert_eq!(loaded.queue_type, QueueType::TierMigrate);
        assert_eq!(loaded.status, QueueStatus::Pending);
        assert_eq!(loaded.study_storage_key, study);
        assert_eq!(loaded.data.as_deref(), Some("{}"));
        assert_eq!(loaded.scheduled_time, inserted.scheduled_time);
    }

    #[test]
    fn dropped_update_context_rolls_back() {
        let storage = Storage::in_memory().unwrap();
        let (_, study) = seed_study(&storage);

        {
            let ctx = storage.open_update_context().unwrap();
            ctx.broker()
                .insert_queue_entry(&NewQueueEntry::new(QueueType::TierMigrate, study))
                .unwrap();
        }

        let all = storage
            .broker()
            .find_queue_entries(&QueueCriteria::for_study(study))
            .unwrap();
        assert!(all.is_empty());
    }

    #[test]
    fn committed_update_context_is_visible_to_other_connections() {
        let storage = Storage::in_memory().unwrap();
        let (_, study) = seed_study(&storage);

        let ctx = storage.open_update_context().unwrap();
        ctx.broker()
            .insert_queue_entry(&NewQueueEntry::new(QueueType::TierMigrate, study))
            .unwrap();
        ctx.commit().unwrap();

        let other = storage.reconnect().unwrap();
        let all = other
            .broker()
            .find_queue_entries(&QueueCriteria::for_study(study))
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn claim_next_skips_future_entries_and_claims_once() {
        let storage = Storage::in_memory().unwrap();
        let (_, study) = seed_study(&storage);
        let broker = storage.broker();
        let now = Utc::now();

        broker
            .insert_queue_entry(
                &NewQueueEntry::new(QueueType::TierMigrate, study)
                    .scheduled_at(now + ChronoDuration::minutes(5)),
            )
            .unwrap();
        let due = broker
            .insert_queue_entry(
                &NewQueueEntry::new(QueueType::TierMigrate, study)
                    .scheduled_at(now - ChronoDuration::minutes(1)),
            )
            .unwrap();

        let claimed = broker.claim_next("worker-1", now).unwrap().unwrap();
        assert_eq!(claimed.id, due.id);
        assert_eq!(claimed.status, QueueStatus::InProgress);
        assert_eq!(claimed.processor_id.as_deref(), Some("worker-1"));

        assert!(broker.claim_next("worker-2", now).unwrap().is_none());
    }

    #[test]
    fn update_rejects_invalid_transition() {
        let storage = Storage::in_memory().unwrap();
        let (_, study) = seed_study(&storage);
        let broker = storage.broker();
        let entry = broker
            .insert_queue_entry(&NewQueueEntry::new(QueueType::TierMigrate, study))
            .unwrap();

        let result = broker.update_queue_entry(
            entry.id,
            &QueueUpdate {
                status: Some(QueueStatus::Completed),
                ..QueueUpdate::default()
            },
        );
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[test]
    fn find_filters_by_type_status_and_exclusion() {
        let storage = Storage::in_memory().unwrap();
        let (_, study) = seed_study(&storage);
        let broker = storage.broker();

        let migrate = broker
            .insert_queue_entry(&NewQueueEntry::new(QueueType::TierMigrate, study))
            .unwrap();
        broker
            .insert_queue_entry(&NewQueueEntry::new(QueueType::StudyProcess, study))
            .unwrap();
        broker
            .insert_queue_entry(
                &NewQueueEntry::new(QueueType::ReconcileStudy, study).status(QueueStatus::Failed),
            )
            .unwrap();

        let related = broker
            .find_queue_entries(&QueueCriteria {
                study_storage_key: Some(study),
                types: vec![QueueType::StudyProcess, QueueType::ReconcileStudy],
                statuses: vec![QueueStatus::Pending, QueueStatus::InProgress],
                exclude: Some(migrate.id),
                limit: None,
            })
            .unwrap();

        assert_eq!(related.len(), 1);
        assert_eq!(related[0].queue_type, QueueType::StudyProcess);
    }

    #[test]
    fn reset_in_progress_requeues_or_fails_stale_entries() {
        let storage = Storage::in_memory().unwrap();
        let (_, study) = seed_study(&storage);
        let broker = storage.broker();
        let now = Utc::now();

        let fresh = broker
            .insert_queue_entry(&NewQueueEntry::new(QueueType::TierMigrate, study))
            .unwrap();
        let tired = broker
            .insert_queue_entry(&NewQueueEntry::new(QueueType::StudyProcess, study))
            .unwrap();
        for id in [fresh.id, tired.id] {
            broker
                .update_queue_entry(
                    id,
                    &QueueUpdate {
                        status: Some(QueueStatus::InProgress),
                        processor_id: Some(Some("node-a".into())),
                        ..QueueUpdate::default()
                    },
                )
                .unwrap();
        }
        broker
            .update_queue_entry(
                tired.id,
                &QueueUpdate {
                    failure_count: Some(2),
                    ..QueueUpdate::default()
                },
            )
            .unwrap();

        let modified = broker
            .reset_in_progress("node-a", now, now + ChronoDuration::minutes(2), 3)
            .unwrap();
        assert_eq!(modified.len(), 2);

        let fresh = broker.get_queue_entry(fresh.id).unwrap();
        assert_eq!(fresh.status, QueueStatus::Pending);
        assert_eq!(fresh.failure_count, 1);
        assert!(fresh.processor_id.is_none());

        let tired = broker.get_queue_entry(tired.id).unwrap();
        assert_eq!(tired.status, QueueStatus::Failed);
        assert_eq!(tired.failure_count, 3);
    }

    #[test]
    fn purge_removes_only_expired_terminal_entries() {
        let storage = Storage::in_memory().unwrap();
        let (_, study) = seed_study(&storage);
        let broker = storage.broker();
        let now = Utc::now();

        broker
            .insert_queue_entry(
                &NewQueueEntry::new(QueueType::TierMigrate, study)
                    .status(QueueStatus::Failed)
                    .expires_at(now - ChronoDuration::minutes(1)),
            )
            .unwrap();
        broker
            .insert_queue_entry(
                &NewQueueEntry::new(QueueType::TierMigrate, study)
                    .status(QueueStatus::Failed)
                    .expires_at(now + ChronoDuration::days(1)),
            )
            .unwrap();
        broker
            .insert_queue_entry(
                &NewQueueEntry::new(QueueType::TierMigrate, study)
                    .expires_at(now - ChronoDuration::minutes(1)),
            )
            .unwrap();

        assert_eq!(broker.purge_expired(now).unwrap(), 1);
        assert_eq!(
            broker
                .find_queue_entries(&QueueCriteria::for_study(study))
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn storage_location_is_mutated_in_place() {
        let storage = Storage::in_memory().unwrap();
        let (_, study) = seed_study(&storage);
        let broker = storage.broker();
        let archive = Filesystem::new("archive", "/fs/archive", 2);
        broker.insert_filesystem(&archive).unwrap();

        broker
            .update_storage_location(
                study,
                &StorageLocationUpdate {
                    filesystem_key: Some(archive.key),
                    ..StorageLocationUpdate::default()
                },
            )
            .unwrap();

        let location = broker.get_storage_location(study).unwrap().unwrap();
        assert_eq!(location.key, study);
        assert_eq!(location.filesystem_key, archive.key);
        assert_eq!(location.filesystem_root, PathBuf::from("/fs/archive"));
        assert_eq!(location.filesystem_tier, 2);
        assert_eq!(location.queue_study_state, QueueStudyState::Idle);
    }

    #[test]
    fn alerts_round_trip_with_context() {
        let storage = Storage::in_memory().unwrap();
        let (_, study) = seed_study(&storage);
        let broker = storage.broker();
        let entry = broker
            .insert_queue_entry(&NewQueueEntry::new(QueueType::TierMigrate, study))
            .unwrap();

        broker
            .insert_alert(&Alert::new(AlertLevel::Warning, "tier_migrate", 1000, "clean up").for_entry(&entry))
            .unwrap();

        let alerts = broker.list_alerts(10).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Warning);
        assert_eq!(alerts[0].context.as_ref().unwrap().entry_id, entry.id);
    }
}
