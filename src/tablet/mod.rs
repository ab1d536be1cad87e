//! Tablet Module
//!
//! A tablet is one replica of one shard of a table. It owns a set of
//! rowsets with non-overlapping version ranges and a persistent
//! `TabletMeta`.
//!
//! # Lock hierarchy
//!
//! Every path that mutates the rowset set takes, in this order:
//! base compaction, cumulative compaction, cold compaction, build index,
//! push, rowset update, header. [`Tablet::lock_for_mutation`] is the only
//! way to take them and hands back a [`MutationPermit`]. The migration lock
//! sits outside that hierarchy and is only ever try-locked by clone.

pub mod meta;
pub mod rowset;

pub use meta::{
    BinlogConfig, BitmapKey, DeleteBitmap, RowsetBinlogMeta, RowsetBinlogMetas, TabletMeta,
    TabletState, BINLOG_METAS_FILE, HEADER_SUFFIX, INVALID_CUMULATIVE_POINT,
};
pub use rowset::{
    binlog_local_name, Rowset, RowsetId, RowsetIdGenerator, RowsetMeta, RowsetSharedPtr, BINLOG_DIR,
};

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::DataDir;
use crate::version::{self, Version, Versions};

/// Shared tablet handle
pub type TabletSharedPtr = Arc<Tablet>;

/// Which replica owns the cooled-down data of this tablet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownConf {
    pub term: i64,
    pub cooldown_replica_id: i64,
}

/// Tablet summary reported to the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletInfo {
    pub tablet_id: i64,
    pub replica_id: i64,
    pub schema_hash: i32,
    /// Highest version reachable from 0 without a hole
    pub version: i64,
    pub row_count: u64,
    pub data_size: u64,
    pub path_hash: i64,
}

/// State guarded by the header lock
struct TabletHeader {
    meta: TabletMeta,
    rs_map: BTreeMap<Version, RowsetSharedPtr>,
}

/// One tablet replica
pub struct Tablet {
    tablet_id: i64,
    schema_hash: i32,
    tablet_path: PathBuf,
    data_dir: Arc<DataDir>,

    migration_lock: RwLock<()>,
    base_compaction_lock: Mutex<()>,
    cumulative_compaction_lock: Mutex<()>,
    cold_compaction_lock: Mutex<()>,
    build_inverted_index_lock: Mutex<()>,
    push_lock: Mutex<()>,
    rowset_update_lock: Mutex<()>,
    header: RwLock<TabletHeader>,

    cooldown_conf: RwLock<CooldownConf>,
}

impl Tablet {
    /// Build a tablet from its meta; every local rowset's files must exist
    pub fn create(
        meta: TabletMeta,
        data_dir: Arc<DataDir>,
        tablet_path: PathBuf,
    ) -> Result<TabletSharedPtr> {
        let mut rs_map = BTreeMap::new();
        for rs_meta in &meta.rs_metas {
            let rs = Rowset::create(rs_meta.clone(), &tablet_path)?;
            if rs_map.insert(rs.version(), rs).is_some() {
                return Err(Error::Internal(format!(
                    "duplicate rowset version {} in tablet {}",
                    rs_meta.version, meta.tablet_id
                )));
            }
        }
        let versions: Vec<Version> = rs_map.keys().copied().collect();
        if let Some((a, b)) = version::find_overlap(&versions) {
            return Err(Error::Internal(format!(
                "overlapping rowsets {} and {} in tablet {}",
                a, b, meta.tablet_id
            )));
        }

        Ok(Arc::new(Self {
            tablet_id: meta.tablet_id,
            schema_hash: meta.schema_hash,
            tablet_path,
            data_dir,
            migration_lock: RwLock::new(()),
            base_compaction_lock: Mutex::new(()),
            cumulative_compaction_lock: Mutex::new(()),
            cold_compaction_lock: Mutex::new(()),
            build_inverted_index_lock: Mutex::new(()),
            push_lock: Mutex::new(()),
            rowset_update_lock: Mutex::new(()),
            header: RwLock::new(TabletHeader { meta, rs_map }),
            cooldown_conf: RwLock::new(CooldownConf::default()),
        }))
    }

    pub fn tablet_id(&self) -> i64 {
        self.tablet_id
    }

    pub fn schema_hash(&self) -> i32 {
        self.schema_hash
    }

    pub fn tablet_path(&self) -> &Path {
        &self.tablet_path
    }

    pub fn data_dir(&self) -> &Arc<DataDir> {
        &self.data_dir
    }

    pub fn replica_id(&self) -> i64 {
        self.header.read().meta.replica_id
    }

    /// Adopt a new replica id and persist it
    pub fn set_replica_id(&self, replica_id: i64) -> Result<()> {
        let mut header = self.header.write();
        header.meta.replica_id = replica_id;
        self.data_dir.meta_store().save(&header.meta)
    }

    pub fn tablet_state(&self) -> TabletState {
        self.header.read().meta.tablet_state
    }

    pub fn set_tablet_state(&self, state: TabletState) {
        self.header.write().meta.tablet_state = state;
    }

    pub fn enable_unique_key_merge_on_write(&self) -> bool {
        self.header.read().meta.enable_unique_key_merge_on_write
    }

    pub fn partition_id(&self) -> i64 {
        self.header.read().meta.partition_id
    }

    /// Shared side of the migration lock, without waiting
    pub fn try_migration_read(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.migration_lock.try_read().ok_or_else(|| {
            Error::TryLockFailed(format!(
                "migration lock of tablet {} is held",
                self.tablet_id
            ))
        })
    }

    /// Exclusive side of the migration lock, taken by disk migration
    pub fn migration_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.migration_lock.write()
    }

    /// Versions up to `spec_version` this tablet lacks
    pub fn missed_versions(&self, spec_version: i64) -> Versions {
        let header = self.header.read();
        version::calc_missed_versions(spec_version, header.rs_map.keys().copied())
    }

    pub fn max_version(&self) -> Option<Version> {
        self.header.read().meta.max_version()
    }

    pub fn max_continuous_version(&self) -> i64 {
        self.header.read().meta.max_continuous_version()
    }

    /// Version ranges of all rowsets, ascending
    pub fn rowset_versions(&self) -> Vec<Version> {
        self.header.read().rs_map.keys().copied().collect()
    }

    /// Rowset handle for `rs_meta` inside this tablet's directory
    pub fn create_rowset(&self, rs_meta: &RowsetMeta) -> Result<RowsetSharedPtr> {
        Rowset::create(rs_meta.clone(), &self.tablet_path)
    }

    /// Whether `rowset_id` belongs to the current rowset set
    pub fn contains_rowset(&self, rowset_id: &RowsetId) -> bool {
        self.header
            .read()
            .rs_map
            .values()
            .any(|rs| rs.rowset_id() == *rowset_id)
    }

    /// Record binlog metas of cloned rowsets
    pub fn ingest_binlog_metas(&self, metas: &RowsetBinlogMetas) -> Result<()> {
        let mut header = self.header.write();
        let mut meta = header.meta.clone();
        meta.ingest_binlog_metas(metas);
        self.data_dir.meta_store().save(&meta)?;
        header.meta = meta;
        Ok(())
    }

    pub fn cooldown_conf(&self) -> CooldownConf {
        *self.cooldown_conf.read()
    }

    pub fn set_cooldown_conf(&self, conf: CooldownConf) {
        *self.cooldown_conf.write() = conf;
    }

    pub fn cumulative_layer_point(&self) -> i64 {
        self.header.read().meta.cumulative_layer_point
    }

    /// Copy of the current meta
    pub fn meta(&self) -> TabletMeta {
        self.header.read().meta.clone()
    }

    /// Persist the current meta
    pub fn save_meta(&self) -> Result<()> {
        let header = self.header.read();
        self.data_dir.meta_store().save(&header.meta)
    }

    /// Report record for this tablet
    pub fn tablet_info(&self) -> TabletInfo {
        let header = self.header.read();
        TabletInfo {
            tablet_id: self.tablet_id,
            replica_id: header.meta.replica_id,
            schema_hash: self.schema_hash,
            version: header.meta.max_continuous_version(),
            row_count: header.meta.total_rows(),
            data_size: header.meta.total_data_size(),
            path_hash: self.data_dir.path_hash(),
        }
    }

    /// Take the whole mutation lock set in the fixed order
    pub fn lock_for_mutation(&self) -> MutationPermit<'_> {
        let base = self.base_compaction_lock.lock();
        let cumulative = self.cumulative_compaction_lock.lock();
        let cold = self.cold_compaction_lock.lock();
        let build_index = self.build_inverted_index_lock.lock();
        let push = self.push_lock.lock();
        let rowset_update = self.rowset_update_lock.lock();
        let header = self.header.write();
        MutationPermit {
            tablet: self,
            header,
            _rowset_update: rowset_update,
            _push: push,
            _build_index: build_index,
            _cold: cold,
            _cumulative: cumulative,
            _base: base,
        }
    }

    /// Ingest one freshly written rowset whose files are already in place
    #[cfg(test)]
    pub(crate) fn add_rowset(&self, rs_meta: RowsetMeta) -> Result<()> {
        let rs = self.create_rowset(&rs_meta)?;
        let mut permit = self.lock_for_mutation();
        permit.revise_tablet_meta(&[rs], &[], true)
    }
}

/// Proof that the full mutation lock set of one tablet is held.
///
/// Guards release in field order: header first, base compaction last.
pub struct MutationPermit<'a> {
    tablet: &'a Tablet,
    header: RwLockWriteGuard<'a, TabletHeader>,
    _rowset_update: MutexGuard<'a, ()>,
    _push: MutexGuard<'a, ()>,
    _build_index: MutexGuard<'a, ()>,
    _cold: MutexGuard<'a, ()>,
    _cumulative: MutexGuard<'a, ()>,
    _base: MutexGuard<'a, ()>,
}

impl<'a> MutationPermit<'a> {
    pub fn tablet(&self) -> &'a Tablet {
        self.tablet
    }

    pub fn meta(&self) -> &TabletMeta {
        &self.header.meta
    }

    /// Missed versions, re-read under the lock
    pub fn missed_versions(&self, spec_version: i64) -> Versions {
        version::calc_missed_versions(spec_version, self.header.rs_map.keys().copied())
    }

    /// Current rowsets, ascending by version
    pub fn rowsets(&self) -> Vec<RowsetSharedPtr> {
        self.header.rs_map.values().cloned().collect()
    }

    /// Swap rowsets in and out of the tablet
    pub fn revise_tablet_meta(
        &mut self,
        to_add: &[RowsetSharedPtr],
        to_delete: &[RowsetSharedPtr],
        is_incremental: bool,
    ) -> Result<()> {
        self.revise_tablet_meta_with(to_add, to_delete, is_incremental, |_| {})
    }

    /// Swap rowsets and apply `edit` to the new meta, all or nothing.
    ///
    /// The new rowset set is validated for overlaps and persisted before the
    /// in-memory state changes; on error nothing is modified.
    pub fn revise_tablet_meta_with<F>(
        &mut self,
        to_add: &[RowsetSharedPtr],
        to_delete: &[RowsetSharedPtr],
        is_incremental: bool,
        edit: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut TabletMeta),
    {
        let tablet_id = self.tablet.tablet_id;
        let mut rs_map = self.header.rs_map.clone();

        for rs in to_delete {
            match rs_map.get(&rs.version()) {
                Some(existing) if existing.rowset_id() == rs.rowset_id() => {
                    rs_map.remove(&rs.version());
                }
                _ => {
                    return Err(Error::Internal(format!(
                        "rowset {} version {} to delete is not in tablet {}",
                        rs.rowset_id(),
                        rs.version(),
                        tablet_id
                    )));
                }
            }
        }
        for rs in to_add {
            if rs_map.insert(rs.version(), Arc::clone(rs)).is_some() {
                return Err(Error::Internal(format!(
                    "version {} already exists in tablet {}",
                    rs.version(),
                    tablet_id
                )));
            }
        }

        let versions: Vec<Version> = rs_map.keys().copied().collect();
        if let Some((a, b)) = version::find_overlap(&versions) {
            return Err(Error::Internal(format!(
                "revise would overlap rowsets {} and {} in tablet {}",
                a, b, tablet_id
            )));
        }

        let mut meta = self.header.meta.clone();
        meta.rs_metas = rs_map.values().map(|rs| rs.meta().clone()).collect();
        if !is_incremental {
            for rs in to_delete {
                meta.delete_bitmap.remove_rowset(&rs.rowset_id());
            }
        }
        edit(&mut meta);

        self.tablet.data_dir.meta_store().save(&meta)?;
        self.header.meta = meta;
        self.header.rs_map = rs_map;

        tracing::debug!(
            tablet_id,
            added = to_add.len(),
            deleted = to_delete.len(),
            is_incremental,
            max_version = ?self.header.meta.max_version(),
            "revised tablet meta"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::storage::DataDir;

    /// Write the segment files of a rowset into `dir` and return its meta
    pub fn write_rowset(
        dir: &Path,
        rowset_id: RowsetId,
        tablet_id: i64,
        version: Version,
        payload: &[u8],
    ) -> RowsetMeta {
        let meta = RowsetMeta {
            rowset_id,
            tablet_id,
            tablet_schema_hash: 1,
            partition_id: 1,
            version,
            num_segments: 1,
            num_rows: (version.end - version.start + 1) as u64,
            data_disk_size: payload.len() as u64 * 2,
            resource_id: None,
            creation_time: 0,
        };
        std::fs::create_dir_all(dir).unwrap();
        for name in meta.segment_file_names() {
            std::fs::write(dir.join(name), payload).unwrap();
        }
        meta
    }

    /// Tablet with one rowset per version range, files on disk
    pub fn tablet_with_versions(
        data_dir: &Arc<DataDir>,
        tablet_id: i64,
        versions: &[Version],
    ) -> TabletSharedPtr {
        let tablet_path = data_dir.tablet_path(0, tablet_id, 1);
        let mut meta = TabletMeta::new(tablet_id, 1, 100, 1, 1);
        for (i, v) in versions.iter().enumerate() {
            let id = RowsetId::new(0xfeed, i as u64 + 1);
            meta.rs_metas
                .push(write_rowset(&tablet_path, id, tablet_id, *v, b"local"));
        }
        Tablet::create(meta, Arc::clone(data_dir), tablet_path).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::storage::DataDir;
    use tempfile::tempdir;

    fn v(start: i64, end: i64) -> Version {
        Version::new(start, end)
    }

    #[test]
    fn test_missed_versions_and_info() {
        let dir = tempdir().unwrap();
        let data_dir = DataDir::open_for_test(dir.path());
        let tablet = tablet_with_versions(&data_dir, 7, &[v(0, 5), v(6, 7)]);

        assert_eq!(tablet.missed_versions(10), vec![v(8, 8), v(9, 9), v(10, 10)]);
        assert!(tablet.missed_versions(7).is_empty());
        let info = tablet.tablet_info();
        assert_eq!(info.version, 7);
        assert_eq!(info.tablet_id, 7);
        assert_eq!(info.replica_id, 100);
    }

    #[test]
    fn test_migration_lock_is_try_only() {
        let dir = tempdir().unwrap();
        let data_dir = DataDir::open_for_test(dir.path());
        let tablet = tablet_with_versions(&data_dir, 7, &[v(0, 1)]);

        {
            let _reader = tablet.try_migration_read().unwrap();
            assert!(tablet.try_migration_read().is_ok());
        }
        let _writer = tablet.migration_write();
        let err = tablet.try_migration_read().unwrap_err();
        assert!(matches!(err, Error::TryLockFailed(_)));
    }

    #[test]
    fn test_revise_rejects_overlap_and_keeps_state() {
        let dir = tempdir().unwrap();
        let data_dir = DataDir::open_for_test(dir.path());
        let tablet = tablet_with_versions(&data_dir, 7, &[v(0, 5), v(6, 7)]);

        let bad = write_rowset(tablet.tablet_path(), RowsetId::new(2, 1), 7, v(7, 9), b"x");
        let bad = tablet.create_rowset(&bad).unwrap();
        let mut permit = tablet.lock_for_mutation();
        let err = permit.revise_tablet_meta(&[bad], &[], true).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        drop(permit);
        assert_eq!(tablet.rowset_versions(), vec![v(0, 5), v(6, 7)]);
    }

    #[test]
    fn test_add_rowset_persists_meta() {
        let dir = tempdir().unwrap();
        let data_dir = DataDir::open_for_test(dir.path());
        let tablet = tablet_with_versions(&data_dir, 7, &[v(0, 5)]);

        let next = write_rowset(tablet.tablet_path(), RowsetId::new(2, 1), 7, v(6, 6), b"x");
        tablet.add_rowset(next).unwrap();
        assert_eq!(tablet.max_version(), Some(v(6, 6)));

        let stored = data_dir.meta_store().load_all().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].max_version(), Some(v(6, 6)));
    }

    #[test]
    fn test_revise_with_edit_is_atomic() {
        let dir = tempdir().unwrap();
        let data_dir = DataDir::open_for_test(dir.path());
        let tablet = tablet_with_versions(&data_dir, 7, &[v(0, 5)]);
        let missing = tablet.create_rowset(&tablet.meta().rs_metas[0]).unwrap();

        let mut permit = tablet.lock_for_mutation();
        let result = permit.revise_tablet_meta_with(&[], &[missing.clone(), missing], false, |meta| {
            meta.cumulative_layer_point = 42;
        });
        assert!(result.is_err());
        assert_eq!(permit.meta().cumulative_layer_point, INVALID_CUMULATIVE_POINT);
    }
}
