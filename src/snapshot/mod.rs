//! Snapshot Module
//!
//! Source side of a clone: hard-link a consistent set of rowset files into
//! a snapshot directory, release it, and sweep snapshots nobody released.
//! The cloning side uses [`SnapshotManager::convert_rowset_ids`] to give
//! downloaded rowsets local ids.
//!
//! Snapshot layout:
//!
//! ```text
//! <root>/snapshot/<YYYYmmddHHMMSS>.<seq>.<timeout>/<tablet_id>/<schema_hash>/
//!     <rowset_id>_<seg>.dat, .idx
//!     <rowset_id>_<seg>.binlog, .binlog-index
//!     rowset_binlog_metas.bin
//!     <tablet_id>.hdr
//! ```

mod guard;

pub use guard::{PendingRowsetGuard, PendingRowsetSet};

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::network::SnapshotRequest;
use crate::storage::{fs, StorageEngine};
use crate::tablet::rowset::{binlog_file_names, segment_file_names};
use crate::tablet::{RowsetBinlogMetas, RowsetMeta, TabletMeta, BINLOG_DIR, BINLOG_METAS_FILE};
use crate::version::Version;

const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Where a snapshot landed and whether it only holds the missing versions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub snapshot_path: PathBuf,
    pub allow_incremental_clone: bool,
}

/// Creates, releases and expires snapshots
pub struct SnapshotManager {
    seq: AtomicU64,
    default_expire_secs: u64,
}

impl SnapshotManager {
    pub fn new(default_expire_secs: u64) -> Self {
        Self {
            seq: AtomicU64::new(0),
            default_expire_secs,
        }
    }

    /// Hard-link the rowsets a requester needs into a new snapshot directory
    pub fn make_snapshot(
        &self,
        engine: &StorageEngine,
        request: &SnapshotRequest,
    ) -> Result<SnapshotOutcome> {
        let tablet = engine
            .tablet_manager()
            .get_tablet(request.tablet_id)
            .ok_or(Error::TabletNotFound(request.tablet_id))?;
        if tablet.schema_hash() != request.schema_hash {
            return Err(Error::InvalidArgument(format!(
                "tablet {} has schema hash {}, requested {}",
                request.tablet_id,
                tablet.schema_hash(),
                request.schema_hash
            )));
        }

        let meta = tablet.meta();
        let version = request
            .version
            .unwrap_or_else(|| meta.max_continuous_version());

        let incremental = if request.missing_version.is_empty() {
            None
        } else {
            select_incremental(&meta, &request.missing_version)
        };
        let allow_incremental_clone = incremental.is_some();
        let rowsets = match incremental {
            Some(rowsets) => rowsets,
            None => select_full(&meta, version)?,
        };

        let timeout = request.timeout.unwrap_or(self.default_expire_secs);
        let snapshot_path = tablet.data_dir().snapshot_root().join(format!(
            "{}.{}.{}",
            Utc::now().format(STAMP_FORMAT),
            self.seq.fetch_add(1, Ordering::Relaxed),
            timeout
        ));
        let target = snapshot_path
            .join(request.tablet_id.to_string())
            .join(request.schema_hash.to_string());

        let copy_binlog = request.is_copy_binlog.unwrap_or(false) && meta.binlog_config.enable;
        let result = write_snapshot_files(tablet.tablet_path(), &target, &meta, &rowsets, copy_binlog);
        if let Err(e) = result {
            if let Err(cleanup) = fs::delete_directory(&snapshot_path) {
                tracing::warn!(
                    path = %snapshot_path.display(),
                    error = %cleanup,
                    "failed to remove unfinished snapshot"
                );
            }
            return Err(e);
        }

        tracing::info!(
            tablet_id = request.tablet_id,
            version,
            rowsets = rowsets.len(),
            incremental = allow_incremental_clone,
            path = %snapshot_path.display(),
            "made snapshot"
        );
        Ok(SnapshotOutcome {
            snapshot_path,
            allow_incremental_clone,
        })
    }

    /// Delete a snapshot directory made by [`Self::make_snapshot`]
    pub fn release_snapshot(&self, engine: &StorageEngine, snapshot_path: &str) -> Result<()> {
        let path = PathBuf::from(snapshot_path.trim_end_matches('/'));
        let path = std::fs::canonicalize(&path).map_err(|e| Error::from_io(&path, e))?;

        let mut allowed = false;
        for root in engine.snapshot_roots() {
            if let Ok(root) = std::fs::canonicalize(&root) {
                if path.parent() == Some(root.as_path()) {
                    allowed = true;
                    break;
                }
            }
        }
        if !allowed {
            return Err(Error::PermissionDenied(format!(
                "{} is not a snapshot directory",
                path.display()
            )));
        }

        fs::delete_directory(&path)?;
        tracing::info!(path = %path.display(), "released snapshot");
        Ok(())
    }

    /// Delete snapshots whose timeout has passed at `now`
    pub fn sweep_expired_snapshots(
        &self,
        engine: &StorageEngine,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut removed = 0;
        for root in engine.snapshot_roots() {
            let entries = match std::fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::from_io(&root, e)),
            };
            for entry in entries {
                let entry = entry.map_err(|e| Error::from_io(&root, e))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let Some(expires_at) = snapshot_expiry(&name) else {
                    tracing::warn!(%name, "unrecognized entry in snapshot root");
                    continue;
                };
                if expires_at <= now {
                    match fs::delete_directory(&entry.path()) {
                        Ok(()) => removed += 1,
                        Err(e) => tracing::warn!(%name, error = %e, "failed to sweep snapshot"),
                    }
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "swept expired snapshots");
        }
        Ok(removed)
    }

    /// Give every downloaded rowset in `clone_dir` a fresh local id.
    ///
    /// Renames data, index and binlog files, rewrites the header and the
    /// binlog metas, and returns guards keeping the new ids pending.
    #[allow(clippy::too_many_arguments)]
    pub fn convert_rowset_ids(
        &self,
        engine: &StorageEngine,
        clone_dir: &Path,
        tablet_id: i64,
        replica_id: i64,
        table_id: i64,
        partition_id: i64,
        schema_hash: i32,
    ) -> Result<Vec<PendingRowsetGuard>> {
        let header_path = TabletMeta::header_file_path(clone_dir, tablet_id);
        let mut meta = TabletMeta::create_from_file(&header_path)?;

        let binlog_metas_path = clone_dir.join(BINLOG_METAS_FILE);
        let mut binlog_metas = if fs::exists(&binlog_metas_path)?
            && fs::file_size(&binlog_metas_path)? > 0
        {
            Some(RowsetBinlogMetas::read_from(&binlog_metas_path)?)
        } else {
            None
        };

        meta.tablet_id = tablet_id;
        meta.replica_id = replica_id;
        meta.table_id = table_id;
        meta.partition_id = partition_id;
        meta.schema_hash = schema_hash;

        let mut guards = Vec::with_capacity(meta.rs_metas.len());
        for rs_meta in meta.rs_metas.iter_mut() {
            let old_id = rs_meta.rowset_id;
            let new_id = engine.next_rowset_id();
            guards.push(engine.pending_rowsets().add(new_id));

            if rs_meta.is_local() {
                let renames = segment_file_names(&old_id, rs_meta.num_segments)
                    .into_iter()
                    .zip(segment_file_names(&new_id, rs_meta.num_segments));
                for (from, to) in renames {
                    rename(&clone_dir.join(from), &clone_dir.join(to))?;
                }
                let binlog_renames = binlog_file_names(&old_id, rs_meta.num_segments)
                    .into_iter()
                    .zip(binlog_file_names(&new_id, rs_meta.num_segments));
                for ((_, from), (_, to)) in binlog_renames {
                    let from = clone_dir.join(from);
                    if fs::exists(&from)? {
                        rename(&from, &clone_dir.join(to))?;
                    }
                }
            }

            rs_meta.rowset_id = new_id;
            rs_meta.tablet_id = tablet_id;
            rs_meta.partition_id = partition_id;
            rs_meta.tablet_schema_hash = schema_hash;

            meta.delete_bitmap.rename_rowset(&old_id, &new_id);
            for binlog in meta.binlog_metas.iter_mut() {
                if binlog.rowset_id == old_id {
                    binlog.rowset_id = new_id;
                }
            }
            if let Some(metas) = binlog_metas.as_mut() {
                for binlog in metas.metas.iter_mut() {
                    if binlog.rowset_id == old_id {
                        binlog.rowset_id = new_id;
                    }
                }
            }
            tracing::debug!(tablet_id, %old_id, %new_id, "converted rowset id");
        }

        if let Some(metas) = binlog_metas {
            metas.write_to(&binlog_metas_path)?;
        }
        meta.save(&header_path)?;
        Ok(guards)
    }
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to).map_err(|e| Error::from_io(from, e))
}

/// Rowsets covering exactly the missing versions, or `None` when some
/// missing version is absent or only reachable through a rowset that also
/// covers versions the requester already has
fn select_incremental(meta: &TabletMeta, missing: &[i64]) -> Option<Vec<RowsetMeta>> {
    let wanted: BTreeSet<i64> = missing.iter().copied().collect();
    let mut selected: Vec<RowsetMeta> = Vec::new();
    for &v in &wanted {
        if selected.iter().any(|m| m.version.contains_version(v)) {
            continue;
        }
        let rs = meta.find_covering_rs_meta(&Version::singleton(v))?;
        if !(rs.version.start..=rs.version.end).all(|x| wanted.contains(&x)) {
            return None;
        }
        selected.push(rs.clone());
    }
    selected.sort_by_key(|m| m.version);
    Some(selected)
}

/// Every rowset needed to rebuild the tablet up to `version`
fn select_full(meta: &TabletMeta, version: i64) -> Result<Vec<RowsetMeta>> {
    let max_continuous = meta.max_continuous_version();
    if max_continuous < version {
        return Err(Error::Internal(format!(
            "fail to capture consistent versions of tablet {} up to {}, max continuous version is {}",
            meta.tablet_id, version, max_continuous
        )));
    }
    let mut selected: Vec<RowsetMeta> = meta
        .rs_metas
        .iter()
        .filter(|m| m.version.start <= version)
        .cloned()
        .collect();
    selected.sort_by_key(|m| m.version);
    Ok(selected)
}

fn write_snapshot_files(
    tablet_path: &Path,
    target: &Path,
    meta: &TabletMeta,
    rowsets: &[RowsetMeta],
    copy_binlog: bool,
) -> Result<()> {
    fs::create_directory(target)?;

    for rs in rowsets.iter().filter(|rs| rs.is_local()) {
        for name in rs.segment_file_names() {
            fs::link_file(&tablet_path.join(&name), &target.join(&name))?;
        }
    }

    let ids: HashSet<_> = rowsets.iter().map(|rs| rs.rowset_id).collect();
    let mut snapshot_meta = meta.clone();
    snapshot_meta.rs_metas = rowsets.to_vec();
    snapshot_meta.binlog_metas.retain(|b| ids.contains(&b.rowset_id));
    snapshot_meta.delete_bitmap.retain_rowsets(|id| ids.contains(id));

    if copy_binlog {
        let binlog_dir = tablet_path.join(BINLOG_DIR);
        let mut shipped = RowsetBinlogMetas::default();
        for binlog in &snapshot_meta.binlog_metas {
            for (local, remote) in binlog_file_names(&binlog.rowset_id, binlog.num_segments) {
                fs::link_file(&binlog_dir.join(local), &target.join(remote))?;
            }
            shipped.metas.push(binlog.clone());
        }
        if !shipped.metas.is_empty() {
            shipped.write_to(&target.join(BINLOG_METAS_FILE))?;
        }
    } else {
        snapshot_meta.binlog_metas.clear();
    }

    snapshot_meta.save(&TabletMeta::header_file_path(target, meta.tablet_id))
}

/// Expiry time encoded in a snapshot directory name
fn snapshot_expiry(name: &str) -> Option<DateTime<Utc>> {
    let mut parts = name.splitn(3, '.');
    let stamp = parts.next()?;
    let _seq: u64 = parts.next()?.parse().ok()?;
    let timeout: i64 = parts.next()?.parse().ok()?;
    let created = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    Some(created.and_utc() + chrono::Duration::seconds(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablet::testutil::{tablet_with_versions, write_rowset};
    use crate::tablet::{RowsetBinlogMeta, RowsetId};
    use tempfile::tempdir;

    fn v(start: i64, end: i64) -> Version {
        Version::new(start, end)
    }

    fn request(tablet_id: i64, version: i64, missing: Vec<i64>) -> SnapshotRequest {
        let mut req = SnapshotRequest::new(tablet_id, 1);
        req.version = Some(version);
        req.missing_version = missing;
        req.is_copy_binlog = Some(true);
        req
    }

    #[test]
    fn test_full_snapshot_layout() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open_for_test(dir.path());
        let tablet = tablet_with_versions(&engine.data_dirs()[0], 9, &[v(0, 5), v(6, 8), v(9, 12)]);
        engine.tablet_manager().add_tablet(tablet).unwrap();

        let outcome = engine.snapshot_mgr().make_snapshot(&engine, &request(9, 8, vec![])).unwrap();
        assert!(!outcome.allow_incremental_clone);

        let target = outcome.snapshot_path.join("9/1");
        let meta = TabletMeta::create_from_file(&target.join("9.hdr")).unwrap();
        let versions: Vec<_> = meta.rs_metas.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![v(0, 5), v(6, 8)]);
        // two rowsets, one segment each, data + index
        assert_eq!(fs::list_files(&target).unwrap().len(), 5);
    }

    #[test]
    fn test_incremental_falls_back_to_full() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open_for_test(dir.path());
        let tablet = tablet_with_versions(&engine.data_dirs()[0], 9, &[v(0, 5), v(6, 7), v(8, 8), v(9, 10)]);
        engine.tablet_manager().add_tablet(tablet).unwrap();

        let inc = engine
            .snapshot_mgr()
            .make_snapshot(&engine, &request(9, 10, vec![8, 9, 10]))
            .unwrap();
        assert!(inc.allow_incremental_clone);
        let meta = TabletMeta::create_from_file(&inc.snapshot_path.join("9/1/9.hdr")).unwrap();
        assert_eq!(meta.rs_metas.len(), 2);

        // version 7 is inside [6-7], which the requester partly has
        let full = engine
            .snapshot_mgr()
            .make_snapshot(&engine, &request(9, 10, vec![7, 8, 9, 10]))
            .unwrap();
        assert!(!full.allow_incremental_clone);

        assert!(engine
            .snapshot_mgr()
            .make_snapshot(&engine, &request(9, 11, vec![]))
            .is_err());
    }

    #[test]
    fn test_release_and_sweep() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open_for_test(dir.path());
        let tablet = tablet_with_versions(&engine.data_dirs()[0], 9, &[v(0, 2)]);
        engine.tablet_manager().add_tablet(tablet).unwrap();

        let outcome = engine.snapshot_mgr().make_snapshot(&engine, &request(9, 2, vec![])).unwrap();
        let path = format!("{}/", outcome.snapshot_path.display());
        engine.snapshot_mgr().release_snapshot(&engine, &path).unwrap();
        assert!(!outcome.snapshot_path.exists());

        let outside = dir.path().join("data");
        assert!(matches!(
            engine.snapshot_mgr().release_snapshot(&engine, &outside.to_string_lossy()),
            Err(Error::PermissionDenied(_))
        ));

        let mut req = request(9, 2, vec![]);
        req.timeout = Some(60);
        let outcome = engine.snapshot_mgr().make_snapshot(&engine, &req).unwrap();
        let mgr = engine.snapshot_mgr();
        assert_eq!(mgr.sweep_expired_snapshots(&engine, Utc::now()).unwrap(), 0);
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(mgr.sweep_expired_snapshots(&engine, later).unwrap(), 1);
        assert!(!outcome.snapshot_path.exists());
    }

    #[test]
    fn test_snapshot_expiry_parse() {
        let expiry = snapshot_expiry("20240102030405.7.60").unwrap();
        assert_eq!(expiry.format(STAMP_FORMAT).to_string(), "20240102030505");
        assert!(snapshot_expiry("garbage").is_none());
        assert!(snapshot_expiry("20240102030405.x.60").is_none());
    }

    #[test]
    fn test_convert_rowset_ids() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open_for_test(dir.path());
        let clone_dir = dir.path().join("clone");

        let remote_id = RowsetId::new(0xabc, 1);
        let rs = write_rowset(&clone_dir, remote_id, 77, v(0, 4), b"remote");
        std::fs::write(clone_dir.join(format!("{}_0.binlog", remote_id)), b"b").unwrap();
        std::fs::write(clone_dir.join(format!("{}_0.binlog-index", remote_id)), b"i").unwrap();

        let mut meta = TabletMeta::new(77, 5, 1, 2, 3);
        meta.rs_metas.push(rs);
        meta.save(&TabletMeta::header_file_path(&clone_dir, 77)).unwrap();
        RowsetBinlogMetas {
            metas: vec![RowsetBinlogMeta { rowset_id: remote_id, version: v(0, 4), num_segments: 1 }],
        }
        .write_to(&clone_dir.join(BINLOG_METAS_FILE))
        .unwrap();

        let guards = engine
            .snapshot_mgr()
            .convert_rowset_ids(&engine, &clone_dir, 77, 500, 20, 30, 6)
            .unwrap();
        assert_eq!(guards.len(), 1);
        let new_id = guards[0].rowset_id();
        assert_ne!(new_id, remote_id);
        assert!(engine.pending_rowsets().contains(&new_id));

        let converted = TabletMeta::create_from_file(&TabletMeta::header_file_path(&clone_dir, 77)).unwrap();
        assert_eq!(converted.schema_hash, 6);
        assert_eq!(converted.replica_id, 500);
        assert_eq!(converted.partition_id, 30);
        assert_eq!(converted.rs_metas[0].rowset_id, new_id);

        assert!(clone_dir.join(format!("{}_0.dat", new_id)).exists());
        assert!(clone_dir.join(format!("{}_0.binlog-index", new_id)).exists());
        assert!(!clone_dir.join(format!("{}_0.dat", remote_id)).exists());
        let binlog = RowsetBinlogMetas::read_from(&clone_dir.join(BINLOG_METAS_FILE)).unwrap();
        assert_eq!(binlog.metas[0].rowset_id, new_id);

        drop(guards);
        assert!(!engine.pending_rowsets().contains(&new_id));
    }
}
