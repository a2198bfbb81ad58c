//! Job state stored in a queue entry's data blob.
//!
//! The blob is a small versioned JSON record, e.g.
//! `{"version":1,"state":"migrated"}`. A missing or empty blob reads as
//! [`JobState::NotStarted`]. The state is written in its own transaction so
//! that it survives independently of the final completion write.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{QueueEntry, QueueEntryId};
use crate::storage::{Broker, QueueUpdate};

pub const STATE_VERSION: u32 = 1;

/// How far a resumable operation got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    NotStarted,
    /// The physical move and its database update are done.
    Migrated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct StateRecord {
    #[serde(default = "current_version")]
    version: u32,
    state: JobState,
}

fn current_version() -> u32 {
    STATE_VERSION
}

pub fn encode(state: JobState) -> Result<String> {
    Ok(serde_json::to_string(&StateRecord {
        version: STATE_VERSION,
        state,
    })?)
}

pub fn decode(blob: Option<&str>) -> Result<JobState> {
    let Some(blob) = blob.map(str::trim).filter(|b| !b.is_empty()) else {
        return Ok(JobState::NotStarted);
    };
    let record: StateRecord = serde_json::from_str(blob)?;
    if record.version > STATE_VERSION {
        return Err(Error::Other(format!(
            "job state version {} is newer than supported version {STATE_VERSION}",
            record.version
        )));
    }
    Ok(record.state)
}

pub fn read_state(entry: &QueueEntry) -> Result<JobState> {
    decode(entry.data.as_deref())
}

/// Persist `state` into the entry's data column.
pub fn write_state(broker: &Broker<'_>, id: QueueEntryId, state: JobState) -> Result<()> {
    let updated = broker.update_queue_entry(
        id,
        &QueueUpdate {
            data: Some(Some(encode(state)?)),
            ..QueueUpdate::default()
        },
    )?;
    if !updated {
        return Err(Error::NotFound(format!("queue entry {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_blob_is_not_started() {
        assert_eq!(decode(None).unwrap(), JobState::NotStarted);
        assert_eq!(decode(Some("  ")).unwrap(), JobState::NotStarted);
    }

    #[test]
    fn encoded_state_reads_back() {
        let blob = encode(JobState::Migrated).unwrap();
        assert_eq!(blob, r#"{"version":1,"state":"migrated"}"#);
        assert_eq!(decode(Some(&blob)).unwrap(), JobState::Migrated);
    }

    #[test]
    fn unversioned_record_is_accepted() {
        assert_eq!(
            decode(Some(r#"{"state":"migrated"}"#)).unwrap(),
            JobState::Migrated
        );
    }

    #[test]
    fn future_version_is_rejected() {
        assert!(decode(Some(r#"{"version":2,"state":"migrated"}"#)).is_err());
        assert!(decode(Some("not json")).is_err());
    }
}
