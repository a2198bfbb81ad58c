//! Storage tier selection and capacity refresh.

use crate::error::Result;
use crate::model::{Filesystem, StorageLocation};
use crate::storage::Broker;

/// Filesystems a study on `source_tier` may move to: strictly lower tier
/// (larger rank), writable, most free space first.
pub fn lower_tier_candidates(filesystems: &[Filesystem], source_tier: i32) -> Vec<&Filesystem> {
    let mut candidates: Vec<&Filesystem> = filesystems
        .iter()
        .filter(|fs| fs.tier > source_tier && fs.is_writable())
        .collect();
    candidates.sort_by(|a, b| b.free_bytes().cmp(&a.free_bytes()));
    candidates
}

/// Pick the destination for a tier move of `location`, if any.
pub fn select_lower_tier(broker: &Broker<'_>, location: &StorageLocation) -> Result<Option<Filesystem>> {
    let filesystems = broker.list_filesystems()?;
    let selected = lower_tier_candidates(&filesystems, location.filesystem_tier)
        .into_iter()
        .find(|fs| fs.key != location.filesystem_key)
        .cloned();

    match &selected {
        Some(fs) => tracing::debug!(
            study = %location.study_instance_uid,
            filesystem = %fs.description,
            tier = fs.tier,
            "selected lower tier filesystem"
        ),
        None => tracing::debug!(
            study = %location.study_instance_uid,
            tier = location.filesystem_tier,
            "no writable lower tier filesystem"
        ),
    }
    Ok(selected)
}

/// Measure every filesystem root and store its capacity figures.
///
/// Roots that cannot be measured are skipped with a warning. Returns the
/// number of filesystems updated.
pub fn refresh_usage(broker: &Broker<'_>) -> Result<usize> {
    let mut updated = 0;
    for fs in broker.list_filesystems()? {
        let measured = fs2::total_space(&fs.root)
            .and_then(|total| fs2::available_space(&fs.root).map(|free| (total, free)));
        match measured {
            Ok((total, free)) => {
                broker.update_filesystem_usage(fs.key, total, total.saturating_sub(free))?;
                updated += 1;
            }
            Err(e) => {
                tracing::warn!(filesystem = %fs.description, root = %fs.root.display(), error = %e, "cannot measure filesystem")
            }
        }
    }
    Ok(updated)
}
