//! Metadata revision after a clone
//!
//! Both finishers run under a [`MutationPermit`] and either revise the
//! tablet meta as a whole or leave it untouched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::fs;
use crate::tablet::{
    MutationPermit, RowsetMeta, RowsetSharedPtr, TabletMeta, INVALID_CUMULATIVE_POINT,
};
use crate::version::{format_versions, Version};

/// Local version ranges split against a downloaded max version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullClonePlan {
    pub to_delete: Vec<Version>,
    pub to_keep: Vec<Version>,
}

/// Decide which local ranges a full clone up to `cloned_max` replaces.
///
/// Ranges ending at or below `cloned_max` are replaced, ranges starting
/// above it are kept. A range straddling it cannot be reconciled.
pub fn plan_full_clone_deletions(local: &[Version], cloned_max: i64) -> Result<FullClonePlan> {
    let mut plan = FullClonePlan::default();
    for v in local {
        if v.start <= cloned_max && v.end > cloned_max {
            return Err(Error::Internal(format!(
                "version cross src latest. cloned_max_version={}, local_version={}",
                cloned_max, v
            )));
        }
        if v.end <= cloned_max {
            plan.to_delete.push(*v);
        } else {
            plan.to_keep.push(*v);
        }
    }
    Ok(plan)
}

/// Downloaded rowset meta serving a missed version: the exact range first,
/// otherwise the range covering it
fn resolve_missed_version<'m>(cloned: &'m TabletMeta, version: &Version) -> Option<&'m RowsetMeta> {
    cloned
        .acquire_rs_meta_by_version(version)
        .or_else(|| cloned.find_covering_rs_meta(version))
}

/// Add the downloaded rowsets filling the versions still missing up to
/// `version`; nothing is deleted
pub fn finish_incremental_clone(
    permit: &mut MutationPermit<'_>,
    cloned: &TabletMeta,
    version: i64,
) -> Result<()> {
    let tablet = permit.tablet();
    // re-read under the lock, writers may have filled some versions meanwhile
    let missed = permit.missed_versions(version);
    tracing::info!(
        tablet_id = tablet.tablet_id(),
        version,
        cloned_replica_id = cloned.replica_id,
        missed_versions = %format_versions(&missed),
        "begin to finish incremental clone"
    );

    let mut seen = HashSet::new();
    let mut resolved: Vec<&RowsetMeta> = Vec::new();
    for v in &missed {
        let rs_meta = resolve_missed_version(cloned, v).ok_or_else(|| {
            Error::Internal(format!(
                "missed version {} is not found in cloned tablet meta",
                v
            ))
        })?;
        if seen.insert(rs_meta.rowset_id) {
            resolved.push(rs_meta);
        }
    }

    let local: Vec<Version> = permit.rowsets().iter().map(|rs| rs.version()).collect();
    for rs_meta in &resolved {
        if let Some(existing) = local.iter().find(|l| l.overlaps(&rs_meta.version)) {
            return Err(Error::Internal(format!(
                "cloned version {} overlaps local version {} of tablet {}",
                rs_meta.version,
                existing,
                tablet.tablet_id()
            )));
        }
    }

    let to_add = resolved
        .into_iter()
        .map(|rs_meta| tablet.create_rowset(rs_meta))
        .collect::<Result<Vec<_>>>()?;
    permit.revise_tablet_meta(&to_add, &[], true)
}

/// Replace every local rowset up to the downloaded max version with the
/// downloaded rowsets. Returns the rowsets taken out of the tablet.
pub fn finish_full_clone(
    permit: &mut MutationPermit<'_>,
    cloned: &TabletMeta,
) -> Result<Vec<RowsetSharedPtr>> {
    let tablet = permit.tablet();
    let cloned_max = cloned.max_version().ok_or_else(|| {
        Error::Internal(format!(
            "cloned tablet meta of tablet {} has no rowsets",
            tablet.tablet_id()
        ))
    })?;
    tracing::info!(
        tablet_id = tablet.tablet_id(),
        cloned_max_version = %cloned_max,
        "begin to finish full clone"
    );

    let local = permit.rowsets();
    let versions: Vec<Version> = local.iter().map(|rs| rs.version()).collect();
    let plan = plan_full_clone_deletions(&versions, cloned_max.end)?;

    let mut to_delete = Vec::with_capacity(plan.to_delete.len());
    for rs in local {
        if plan.to_delete.contains(&rs.version()) {
            to_delete.push(rs);
        } else if !rs.is_local() {
            // cooled rowsets are always a prefix of the version chain
            return Err(Error::Internal(format!(
                "rowset {} of tablet {} above cloned max version {} is not local",
                rs.version(),
                tablet.tablet_id(),
                cloned_max
            )));
        }
    }

    let to_add = cloned
        .rs_metas
        .iter()
        .map(|rs_meta| tablet.create_rowset(rs_meta))
        .collect::<Result<Vec<_>>>()?;

    let meta = permit.meta();
    let cooldown_meta_id = if tablet.cooldown_conf().cooldown_replica_id == meta.replica_id {
        // a cooldown owner must not keep an id from an earlier cooldown term
        Some(Uuid::new_v4())
    } else {
        cloned.cooldown_meta_id
    };
    let merge_delete_bitmap = meta.enable_unique_key_merge_on_write;

    permit.revise_tablet_meta_with(&to_add, &to_delete, false, |meta| {
        meta.cooldown_meta_id = cooldown_meta_id;
        if merge_delete_bitmap {
            meta.delete_bitmap.merge(&cloned.delete_bitmap);
        }
        meta.cumulative_layer_point = INVALID_CUMULATIVE_POINT;
    })?;
    Ok(to_delete)
}

/// Removes a directory when dropped, warning on failure
pub struct RemoveDirOnDrop {
    path: PathBuf,
}

impl RemoveDirOnDrop {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RemoveDirOnDrop {
    fn drop(&mut self) {
        if let Err(e) = fs::delete_directory(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove dir");
        }
    }
}
