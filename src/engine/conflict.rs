//! Conflict detection between queue entries on the same study.
//!
//! Best effort, not a lock: two entries that both pass the check before either
//! starts are resolved by the next deferred attempt.

use crate::error::Result;
use crate::model::{IntegrityEntry, QueueEntry, QueueStatus, QueueType};
use crate::storage::{Broker, QueueCriteria};

/// Entry types that must not run alongside a tier move of the same study.
pub const TIER_MIGRATE_CONFLICTS: &[QueueType] = &[
    QueueType::StudyProcess,
    QueueType::ReconcileStudy,
    QueueType::ProcessDuplicate,
    QueueType::ReconcilePostProcess,
    QueueType::ReconcileCleanup,
];

/// What blocks an entry from starting.
#[derive(Debug, Default)]
pub struct Conflicts {
    pub entries: Vec<QueueEntry>,
    pub integrity: Vec<IntegrityEntry>,
}

impl Conflicts {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.integrity.is_empty()
    }

    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{} entry {} ({})", e.queue_type, e.id, e.status))
            .collect();
        if !self.integrity.is_empty() {
            parts.push(format!(
                "{} unresolved reconciliation entr{}",
                self.integrity.len(),
                if self.integrity.len() == 1 { "y" } else { "ies" }
            ));
        }
        parts.join(", ")
    }
}

/// Active entries of `types` on `entry`'s study (other than `entry`) and any
/// unresolved reconciliation entries for it.
pub fn find_conflicts(
    broker: &Broker<'_>,
    entry: &QueueEntry,
    types: &[QueueType],
) -> Result<Conflicts> {
    let entries = if types.is_empty() {
        Vec::new()
    } else {
        broker.find_queue_entries(&QueueCriteria {
            study_storage_key: Some(entry.study_storage_key),
            types: types.to_vec(),
            statuses: vec![QueueStatus::Pending, QueueStatus::InProgress, QueueStatus::Idle],
            exclude: Some(entry.id),
            limit: None,
        })?
    };
    let integrity = broker.find_integrity_entries(entry.study_storage_key)?;

    Ok(Conflicts { entries, integrity })
}

pub fn has_conflicts(broker: &Broker<'_>, entry: &QueueEntry, types: &[QueueType]) -> Result<bool> {
    Ok(!find_conflicts(broker, entry, types)?.is_empty())
}
