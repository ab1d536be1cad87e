//! Storage Engine
//!
//! Owns the data dirs, the tablet registry, the snapshot manager and the
//! bookkeeping shared by clone and garbage collection.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use super::data_dir::DataDir;
use super::fs;
use super::tablet_manager::TabletManager;
use super::StorageMedium;
use crate::config::{SnapshotConfig, StorageConfig};
use crate::error::{Error, Result};
use crate::snapshot::{PendingRowsetSet, SnapshotManager};
use crate::tablet::{RowsetId, RowsetIdGenerator, RowsetSharedPtr, HEADER_SUFFIX};

/// Local storage of one node
pub struct StorageEngine {
    data_dirs: Vec<Arc<DataDir>>,
    tablet_manager: TabletManager,
    snapshot_mgr: SnapshotManager,
    rowset_id_generator: RowsetIdGenerator,
    pending_rowsets: Arc<PendingRowsetSet>,
    /// tablet id -> versions committed but not yet published
    pending_publish: Mutex<HashMap<i64, BTreeSet<i64>>>,
    unused_rowsets: Mutex<Vec<RowsetSharedPtr>>,
}

impl StorageEngine {
    /// Open every data dir and load the tablets they hold
    pub fn open(storage: &StorageConfig, snapshot: &SnapshotConfig) -> Result<Arc<Self>> {
        let mut data_dirs = Vec::with_capacity(storage.paths.len());
        for path_config in &storage.paths {
            data_dirs.push(Arc::new(DataDir::open(path_config, storage)?));
        }

        let tablet_manager = TabletManager::new();
        for data_dir in &data_dirs {
            let loaded = tablet_manager.load_data_dir(data_dir)?;
            tracing::info!(path = %data_dir.path().display(), loaded, "loaded tablets");
        }

        Ok(Arc::new(Self {
            data_dirs,
            tablet_manager,
            snapshot_mgr: SnapshotManager::new(snapshot.default_expire_secs),
            rowset_id_generator: RowsetIdGenerator::new(),
            pending_rowsets: PendingRowsetSet::new(),
            pending_publish: Mutex::new(HashMap::new()),
            unused_rowsets: Mutex::new(Vec::new()),
        }))
    }

    pub fn data_dirs(&self) -> &[Arc<DataDir>] {
        &self.data_dirs
    }

    pub fn tablet_manager(&self) -> &TabletManager {
        &self.tablet_manager
    }

    pub fn snapshot_mgr(&self) -> &SnapshotManager {
        &self.snapshot_mgr
    }

    pub fn pending_rowsets(&self) -> &Arc<PendingRowsetSet> {
        &self.pending_rowsets
    }

    pub fn next_rowset_id(&self) -> RowsetId {
        self.rowset_id_generator.next_id()
    }

    pub fn snapshot_roots(&self) -> Vec<PathBuf> {
        self.data_dirs.iter().map(|d| d.snapshot_root()).collect()
    }

    /// Pick a data dir and shard for a new tablet.
    ///
    /// `path_hash` pins the data dir when it names one; otherwise dirs of
    /// `medium` below their capacity limit are preferred, and partitions
    /// rotate across them.
    pub fn obtain_shard_path(
        &self,
        medium: Option<StorageMedium>,
        path_hash: Option<i64>,
        partition_id: i64,
    ) -> Result<(Arc<DataDir>, u64)> {
        if let Some(hash) = path_hash.filter(|h| *h != 0 && *h != -1) {
            if let Some(dir) = self.data_dirs.iter().find(|d| d.path_hash() == hash) {
                let shard = dir.get_shard()?;
                return Ok((Arc::clone(dir), shard));
            }
            tracing::warn!(path_hash = hash, "requested path hash not found, choosing by medium");
        }

        for dir in &self.data_dirs {
            dir.update_capacity()?;
        }
        let usable: Vec<&Arc<DataDir>> = self
            .data_dirs
            .iter()
            .filter(|d| !d.reach_capacity_limit(0))
            .collect();
        let preferred: Vec<&Arc<DataDir>> = match medium {
            Some(medium) => usable
                .iter()
                .copied()
                .filter(|d| d.storage_medium() == medium)
                .collect(),
            None => Vec::new(),
        };
        let candidates = if preferred.is_empty() { usable } else { preferred };
        if candidates.is_empty() {
            return Err(Error::NotFound(format!(
                "no data dir with free capacity for medium {:?}",
                medium
            )));
        }

        let dir = candidates[partition_id.rem_euclid(candidates.len() as i64) as usize];
        let shard = dir.get_shard()?;
        Ok((Arc::clone(dir), shard))
    }

    /// Record a version committed to `tablet_id` but not yet published
    pub fn add_pending_publish(&self, tablet_id: i64, version: i64) {
        self.pending_publish
            .lock()
            .entry(tablet_id)
            .or_default()
            .insert(version);
    }

    pub fn remove_pending_publish(&self, tablet_id: i64, version: i64) {
        let mut pending = self.pending_publish.lock();
        if let Some(versions) = pending.get_mut(&tablet_id) {
            versions.remove(&version);
            if versions.is_empty() {
                pending.remove(&tablet_id);
            }
        }
    }

    /// Lowest version of `tablet_id` waiting to publish, `i64::MAX` if none
    pub fn get_pending_publish_min_version(&self, tablet_id: i64) -> i64 {
        self.pending_publish
            .lock()
            .get(&tablet_id)
            .and_then(|v| v.iter().next().copied())
            .unwrap_or(i64::MAX)
    }

    /// Hand rowsets removed from a tablet over to the sweeper
    pub fn add_unused_rowsets(&self, rowsets: impl IntoIterator<Item = RowsetSharedPtr>) {
        self.unused_rowsets.lock().extend(rowsets);
    }

    pub fn unused_rowset_count(&self) -> usize {
        self.unused_rowsets.lock().len()
    }

    /// Delete rowset files in tablet directories that no tablet references.
    ///
    /// Files of pending rowsets are kept.
    pub fn sweep_unused_rowset_files(&self) -> Result<usize> {
        let mut deleted = 0;
        for tablet in self.tablet_manager.all_tablets() {
            let files = match fs::list_files(tablet.tablet_path()) {
                Ok(files) => files,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let mut orphans = Vec::new();
            for name in files {
                if name.ends_with(HEADER_SUFFIX) {
                    continue;
                }
                let Some(rowset_id) = RowsetId::from_file_name(&name) else {
                    continue;
                };
                if self.pending_rowsets.contains(&rowset_id) || tablet.contains_rowset(&rowset_id) {
                    continue;
                }
                orphans.push(tablet.tablet_path().join(name));
            }
            if !orphans.is_empty() {
                tracing::info!(
                    tablet_id = tablet.tablet_id(),
                    files = orphans.len(),
                    "deleting unused rowset files"
                );
                fs::batch_delete(&orphans)?;
                deleted += orphans.len();
            }
        }
        self.unused_rowsets.lock().clear();
        Ok(deleted)
    }

    /// Delete snapshots past their timeout
    pub fn sweep_expired_snapshots(&self) -> Result<usize> {
        self.snapshot_mgr
            .sweep_expired_snapshots(self, chrono::Utc::now())
    }

    #[cfg(test)]
    pub(crate) fn open_for_test(path: &std::path::Path) -> Arc<Self> {
        Self::open_with_capacity_for_test(path, 1 << 40)
    }

    /// Single data dir engine whose disk holds only `capacity` bytes
    #[cfg(test)]
    pub(crate) fn open_with_capacity_for_test(path: &std::path::Path, capacity: u64) -> Arc<Self> {
        let data_dir = DataDir::open_with_capacity(path, capacity);
        Arc::new(Self {
            data_dirs: vec![data_dir],
            tablet_manager: TabletManager::new(),
            snapshot_mgr: SnapshotManager::new(3600),
            rowset_id_generator: RowsetIdGenerator::new(),
            pending_rowsets: PendingRowsetSet::new(),
            pending_publish: Mutex::new(HashMap::new()),
            unused_rowsets: Mutex::new(Vec::new()),
        })
    }
}
